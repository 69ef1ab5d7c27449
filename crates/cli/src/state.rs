//! Bootstrap progress persistence.
//!
//! A bootstrap run records the step it reached in `outputs/bootstrap-state.json`, so re-running
//! the same command resumes where the previous run stopped. The `clusterctl move` marker lives
//! next to it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{OUTPUT_BOOTSTRAP_STATE, OUTPUT_CLUSTERCTL_MOVE_MARKER};
use crate::error::Result;

/// Steps of the bootstrap workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStep {
    /// Not yet started.
    NotStarted,
    /// Config parsed, credentials and executables checked.
    Init,
    /// Local K3D management cluster is up.
    ManagementUp,
    /// KubeAid config repository cloned and checked out.
    ConfigRepoPrep,
    /// One-shot cloud infrastructure (IAM stack, OIDC provider, VSwitch).
    CloudPrereqs,
    /// Sealed secrets, ArgoCD and the CAPI stack installed in the management cluster.
    ManagementSetup,
    /// Main cluster provisioned and its kubeconfig saved.
    ProvisionWait,
    /// Active kubeconfig switched to the main cluster and workers initialized.
    Handover,
    /// Secrets re-sealed under the main cluster's controller key.
    Reseal,
    /// Sealed secrets, ArgoCD and the CAPI stack installed in the main cluster.
    MainSetup,
    /// CAPI resources moved into the main cluster.
    Pivot,
    /// Backup buckets, IAM and Velero configured.
    DisasterRecoverySetup,
    /// Every ArgoCD App synced.
    SyncAll,
    /// Done.
    Complete,
}

impl BootstrapStep {
    /// The step after this one.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::NotStarted => Self::Init,
            Self::Init => Self::ManagementUp,
            Self::ManagementUp => Self::ConfigRepoPrep,
            Self::ConfigRepoPrep => Self::CloudPrereqs,
            Self::CloudPrereqs => Self::ManagementSetup,
            Self::ManagementSetup => Self::ProvisionWait,
            Self::ProvisionWait => Self::Handover,
            Self::Handover => Self::Reseal,
            Self::Reseal => Self::MainSetup,
            Self::MainSetup => Self::Pivot,
            Self::Pivot => Self::DisasterRecoverySetup,
            Self::DisasterRecoverySetup => Self::SyncAll,
            Self::SyncAll | Self::Complete => Self::Complete,
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Init => "Parsing configuration and checking prerequisites",
            Self::ManagementUp => "Creating the local management cluster",
            Self::ConfigRepoPrep => "Preparing the KubeAid config repository",
            Self::CloudPrereqs => "Bootstrapping cloud infrastructure",
            Self::ManagementSetup => "Setting up the management cluster",
            Self::ProvisionWait => "Waiting for the main cluster to be provisioned",
            Self::Handover => "Switching to the main cluster",
            Self::Reseal => "Re-sealing secrets for the main cluster",
            Self::MainSetup => "Setting up the main cluster",
            Self::Pivot => "Moving Cluster API resources into the main cluster",
            Self::DisasterRecoverySetup => "Setting up disaster recovery",
            Self::SyncAll => "Syncing all ArgoCD Apps",
            Self::Complete => "Complete",
        }
    }

    /// Position for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Init => 1,
            Self::ManagementUp => 2,
            Self::ConfigRepoPrep => 3,
            Self::CloudPrereqs => 4,
            Self::ManagementSetup => 5,
            Self::ProvisionWait => 6,
            Self::Handover => 7,
            Self::Reseal => 8,
            Self::MainSetup => 9,
            Self::Pivot => 10,
            Self::DisasterRecoverySetup => 11,
            Self::SyncAll => 12,
            Self::Complete => 13,
        }
    }

    pub const TOTAL_STEPS: u8 = 12;
}

impl std::fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Persisted progress of a bootstrap run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapState {
    /// Cluster the run belongs to.
    pub cluster: String,
    /// Whether the run is part of a disaster recovery.
    #[serde(default)]
    pub disaster_recovery: bool,
    pub step: BootstrapStep,
    /// RFC 3339 timestamp of the last update.
    pub updated_at: String,
    /// Failed attempts of the current step.
    pub attempt_count: u32,
    pub last_error: Option<String>,

    #[serde(skip)]
    outputs_dir: PathBuf,
}

impl BootstrapState {
    #[must_use]
    pub fn new(outputs_dir: &Path, cluster: &str, disaster_recovery: bool) -> Self {
        Self {
            cluster: cluster.to_string(),
            disaster_recovery,
            step: BootstrapStep::NotStarted,
            updated_at: chrono::Utc::now().to_rfc3339(),
            attempt_count: 0,
            last_error: None,
            outputs_dir: outputs_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn state_file(outputs_dir: &Path) -> PathBuf {
        outputs_dir.join(OUTPUT_BOOTSTRAP_STATE)
    }

    /// Load the state of a previous run of the same cluster, or start a fresh one.
    ///
    /// A state file recorded for a different cluster or workflow is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_new(outputs_dir: &Path, cluster: &str, disaster_recovery: bool) -> Result<Self> {
        let path = Self::state_file(outputs_dir);
        if !path.exists() {
            return Ok(Self::new(outputs_dir, cluster, disaster_recovery));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut state: Self = serde_json::from_str(&content)?;

        if state.cluster != cluster || state.disaster_recovery != disaster_recovery {
            warn!(
                recorded = %state.cluster,
                cluster = %cluster,
                "Ignoring bootstrap state recorded for a different run"
            );
            return Ok(Self::new(outputs_dir, cluster, disaster_recovery));
        }

        state.outputs_dir = outputs_dir.to_path_buf();
        info!(
            cluster = %cluster,
            step = ?state.step,
            attempt = state.attempt_count,
            "Loaded bootstrap state"
        );
        Ok(state)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        std::fs::create_dir_all(&self.outputs_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::state_file(&self.outputs_dir), content)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_step(&mut self, step: BootstrapStep) -> Result<()> {
        info!("Step: {} -> {}", self.step, step);
        self.step = step;
        self.attempt_count = 0;
        self.last_error = None;
        self.save()
    }

    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn advance(&mut self) -> Result<()> {
        self.set_step(self.step.next())
    }

    /// Record a failed attempt of the current step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_error(&mut self, error: &str) -> Result<()> {
        self.last_error = Some(error.to_string());
        self.attempt_count += 1;
        self.save()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == BootstrapStep::Complete
    }

    /// Whether a previous run got somewhere.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.step != BootstrapStep::NotStarted && !self.is_complete()
    }
}

/// Backoff for transiently failing steps.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `operation` until it succeeds, retrying transient failures with backoff.
///
/// # Errors
///
/// Returns the first non-transient error, or the last error once the attempts are used up.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && config.should_retry(attempt + 1) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation = %what,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// clusterctl move marker
// ============================================================================

#[must_use]
pub fn pivot_marker_path(outputs_dir: &Path) -> PathBuf {
    outputs_dir.join(OUTPUT_CLUSTERCTL_MOVE_MARKER)
}

/// Whether a `clusterctl move` into the main cluster was recorded.
#[must_use]
pub fn pivot_marker_present(outputs_dir: &Path) -> bool {
    pivot_marker_path(outputs_dir).is_file()
}

/// Record a completed `clusterctl move` into the main cluster.
///
/// # Errors
///
/// Returns an error if the marker cannot be written.
pub fn write_pivot_marker(outputs_dir: &Path, cluster: &str) -> Result<()> {
    std::fs::create_dir_all(outputs_dir)?;
    std::fs::write(
        pivot_marker_path(outputs_dir),
        format!("{cluster} {}\n", chrono::Utc::now().to_rfc3339()),
    )?;
    Ok(())
}

/// Forget the pivot, after the Cluster was moved back to the management cluster.
///
/// # Errors
///
/// Returns an error if an existing marker cannot be removed.
pub fn clear_pivot_marker(outputs_dir: &Path) -> Result<()> {
    match std::fs::remove_file(pivot_marker_path(outputs_dir)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
