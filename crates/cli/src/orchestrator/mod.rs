//! Workflow orchestration.
//!
//! [`Bootstrapper`] walks the persisted [`BootstrapStep`]s of `devenv create`, `cluster
//! bootstrap` and the bootstrap half of `cluster recover`:
//! - a local K3D management cluster with ArgoCD and Cluster API
//! - the KubeAid config fork rendered, sealed and pushed
//! - the main cluster provisioned, set up and made self-managing
//!
//! The other workflows live in their own modules.

pub mod checkout;
pub mod connectivity;
pub mod delete;
pub mod recover;
pub mod setup;
pub mod upgrade;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::argocd::connect_to;
use crate::capi::{
    control_plane_endpoint, is_clusterctl_move_executed, remove_control_plane_no_schedule_taints,
    save_kubeconfig, wait_provisioned, wait_ready, ClusterRef, Clusterctl,
};
use crate::cloud::CloudProvider;
use crate::config::{CloudKind, HetznerMode};
use crate::constants::{
    APP_CAPI_CLUSTER, APP_CLUSTER_AUTOSCALER, APP_EXTERNAL_SNAPSHOTTER, CAPI_POLL,
    CRONJOB_BACKUP_SEALED_SECRETS, KUBECONFIG_SECRET_POLL, NAMESPACE_SEALED_SECRETS,
};
use crate::error::{Error, Result};
use crate::k3d::{relabel_masters, K3d};
use crate::k8s::connect;
use crate::sealed_secrets::Sealer;
use crate::session::{ensure_executables, required_executables, ClusterTarget, Session};
use crate::state::{
    retry_transient, write_pivot_marker, BootstrapState, BootstrapStep, RetryConfig,
};
use crate::templates::{
    select_templates, set_cilium_endpoint, ApiEndpoint, CloudTemplateValues, Renderer,
};
use crate::ui;
use crate::velero;

use checkout::{build_kube_prometheus, commit_message, template_values, Checkouts};
use setup::{install_capi_stack, install_gitops, install_sealed_secrets, setup_cluster};

/// Name of the Velero Backup taken right after a fresh bootstrap.
const INITIAL_BACKUP: &str = "init";

/// Drives the bootstrap workflow with persisted, resumable progress.
pub struct Bootstrapper<'a> {
    session: &'a Session,
    /// Progress (persisted across runs).
    state: BootstrapState,
    /// Backoff for transient failures.
    retry_config: RetryConfig,
    /// Last step this run executes.
    last_step: BootstrapStep,
    renderer: Renderer,
}

impl<'a> Bootstrapper<'a> {
    /// Load the progress of a previous run of the same workflow, or start a fresh one.
    ///
    /// A completed run starts over, every step being safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be read or the templates do not compile.
    pub fn new_or_resume(session: &'a Session, disaster_recovery: bool) -> Result<Self> {
        let outputs = &session.paths.outputs;
        std::fs::create_dir_all(outputs)?;

        let mut state = BootstrapState::load_or_new(outputs, session.cluster_name(), disaster_recovery)?;
        if state.can_resume() {
            ui::print_info(&format!("Resuming from: {}", state.step));
            if let Some(ref err) = state.last_error {
                ui::print_warning(&format!("Previous error: {err}"));
            }
        } else if state.is_complete() {
            info!(cluster = %session.cluster_name(), "Previous run completed, starting over");
            state = BootstrapState::new(outputs, session.cluster_name(), disaster_recovery);
        }

        Ok(Self {
            session,
            state,
            retry_config: RetryConfig::default(),
            last_step: BootstrapStep::SyncAll,
            renderer: Renderer::new()?,
        })
    }

    /// Stop once `step` is done.
    #[must_use]
    pub fn stop_after(mut self, step: BootstrapStep) -> Self {
        self.last_step = step;
        self
    }

    #[must_use]
    pub fn step(&self) -> BootstrapStep {
        self.state.step
    }

    /// Run every remaining step up to the last one, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the error of the step that failed for good. Progress is saved, so re-running
    /// the same command resumes at that step.
    pub async fn run_to_completion(&mut self) -> Result<()> {
        if self.state.step == BootstrapStep::NotStarted {
            self.state.advance()?;
        }
        if self.state.step > self.last_step {
            ui::print_info(&format!("Nothing to do, already at: {}", self.state.step));
            return Ok(());
        }

        ui::print_section(&format!("Cluster {}", self.session.cluster_name()));

        while self.state.step <= self.last_step {
            ui::print_progress_step(
                self.state.step.step_number(),
                BootstrapStep::TOTAL_STEPS,
                self.state.step.description(),
            );

            match self.execute_current_step().await {
                Ok(()) => self.state.advance()?,
                Err(e) => {
                    self.state.record_error(&e.to_string())?;

                    if e.is_transient() && self.retry_config.should_retry(self.state.attempt_count) {
                        let delay = self.retry_config.delay_for_attempt(self.state.attempt_count);
                        warn!(
                            attempt = self.state.attempt_count,
                            error = %e,
                            delay_secs = delay.as_secs(),
                            "Transient error, retrying"
                        );
                        ui::print_warning(&format!(
                            "Transient error (attempt {}): {e}",
                            self.state.attempt_count
                        ));
                        ui::print_info(&format!("Retrying in {} seconds...", delay.as_secs()));
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(
                        step = ?self.state.step,
                        cluster = %self.session.cluster_name(),
                        cloud = %self.session.cloud_kind(),
                        error = %e,
                        "Bootstrap failed"
                    );
                    ui::print_error(&format!("Failed at step '{}': {e}", self.state.step));
                    ui::print_info("State has been saved. Re-run the same command to resume.");
                    return Err(e);
                }
            }
        }

        if self.state.is_complete() {
            ui::print_success(&format!(
                "Cluster {} has been bootstrapped",
                self.session.cluster_name()
            ));
        }
        Ok(())
    }

    async fn execute_current_step(&mut self) -> Result<()> {
        info!(step = ?self.state.step, "Executing step");

        match self.state.step {
            BootstrapStep::NotStarted | BootstrapStep::Complete => Ok(()),
            BootstrapStep::Init => self.init(),
            BootstrapStep::ManagementUp => self.create_management_cluster().await,
            BootstrapStep::ConfigRepoPrep => self.prepare_config_repo().await,
            BootstrapStep::CloudPrereqs => self.provider().setup_prerequisites(self.session).await,
            BootstrapStep::ManagementSetup => self.setup_management_cluster().await,
            BootstrapStep::ProvisionWait => self.provision_main_cluster().await,
            BootstrapStep::Handover => self.handover().await,
            BootstrapStep::Reseal => self.reseal().await,
            BootstrapStep::MainSetup => self.setup_main_cluster().await,
            BootstrapStep::Pivot => self.pivot().await,
            BootstrapStep::DisasterRecoverySetup => self.setup_disaster_recovery().await,
            BootstrapStep::SyncAll => self.sync_all().await,
        }
    }

    fn provider(&self) -> &'a dyn CloudProvider {
        self.session.cloud.provider()
    }

    fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::new(self.session.cluster_name(), self.session.config.capi_namespace())
    }

    /// Endpoint of the main cluster's API server, once some cluster knows it.
    async fn main_cluster_endpoint(&self) -> Option<ApiEndpoint> {
        let management = self.session.kubeconfig(ClusterTarget::Management);
        let main = self.session.kubeconfig(ClusterTarget::Main);
        control_plane_endpoint(&[&management, &main], &self.cluster_ref()).await
    }

    // ========================================================================
    // Steps 1-5: management cluster
    // ========================================================================

    fn init(&self) -> Result<()> {
        ensure_executables(&required_executables(self.session.cloud_kind()))?;
        info!(
            cluster = %self.session.cluster_name(),
            cloud = %self.session.cloud_kind(),
            disaster_recovery = self.state.disaster_recovery,
            "Configuration loaded"
        );
        Ok(())
    }

    async fn create_management_cluster(&self) -> Result<()> {
        let name = &self.session.flags.management_cluster_name;
        K3d::new(Arc::clone(&self.session.runner))
            .create_cluster(&self.session.config, &self.session.paths, name)
            .await?;

        let kubeconfig = self.session.kubeconfig(ClusterTarget::Management);
        relabel_masters(&self.session.kubectl(&kubeconfig)).await
    }

    async fn prepare_config_repo(&self) -> Result<()> {
        let session = self.session;
        let mut checkouts = Checkouts::prepare(session).await?;
        checkouts.config_repo.start_change(session).await?;

        if self.state.disaster_recovery {
            // The recovered cluster's sealed secrets stay valid under the restored keys.
            let cluster_dir = checkouts.cluster_dir(&session.config);
            match self.main_cluster_endpoint().await {
                Some(endpoint) => set_cilium_endpoint(&cluster_dir, &endpoint)?,
                None => debug!("Main cluster endpoint not known yet, keeping Cilium values"),
            }
        } else {
            let cloud_values = self.provider().template_values(session).await?;
            self.render_config(&checkouts, cloud_values, ClusterTarget::Management)
                .await?;
        }

        checkouts
            .config_repo
            .publish(
                &session.config,
                &commit_message(session.cluster_name(), "created / updated KubeAid config files"),
            )
            .await
    }

    /// Render every template, then seal the secrets with `seal_with`'s controller.
    ///
    /// Expects the change branch to be checked out.
    async fn render_config(
        &self,
        checkouts: &Checkouts,
        cloud_values: CloudTemplateValues,
        seal_with: ClusterTarget,
    ) -> Result<()> {
        let session = self.session;
        let cluster_dir = checkouts.cluster_dir(&session.config);
        let selection = select_templates(&session.config, &session.flags);
        let values = template_values(session, cloud_values, self.main_cluster_endpoint().await)?;

        self.renderer
            .render_all(&selection.non_secret, &values, &cluster_dir)?;
        if !session.flags.skip_kube_prometheus_build && !session.flags.skip_monitoring_setup {
            build_kube_prometheus(session, &checkouts.kubeaid_dir, &cluster_dir).await?;
        }

        // Sealing needs a running controller, whose values file was just rendered.
        let kubeconfig = session.kubeconfig(seal_with);
        install_sealed_secrets(session, &kubeconfig, &checkouts.kubeaid_dir, &cluster_dir, false)
            .await?;
        let sealer = Sealer::fetch(Arc::clone(&session.runner), &kubeconfig).await?;

        let secrets = self
            .renderer
            .render_all(&selection.secret, &values, &cluster_dir)?;
        sealer.seal_all(&secrets).await?;
        Ok(())
    }

    async fn setup_management_cluster(&self) -> Result<()> {
        let session = self.session;
        let kubeconfig = session.kubeconfig(ClusterTarget::Management);
        let checkouts = Checkouts::prepare(session).await?;
        let cluster_dir = checkouts.cluster_dir(&session.config);

        let mut argocd = install_gitops(
            session,
            &kubeconfig,
            &checkouts.kubeaid_dir,
            &cluster_dir,
            self.state.disaster_recovery,
        )
        .await?;
        let client = connect(&kubeconfig).await?;

        if let Some(cloud_values) = self
            .provider()
            .provision_infrastructure(session, &mut argocd, &client)
            .await?
        {
            let mut checkouts = checkouts;
            checkouts.config_repo.start_change(session).await?;
            self.render_config(&checkouts, cloud_values, ClusterTarget::Management)
                .await?;
            checkouts
                .config_repo
                .publish(
                    &session.config,
                    &commit_message(session.cluster_name(), "updated with provisioned infrastructure"),
                )
                .await?;
        }

        if session.cloud_kind().uses_capi() {
            install_capi_stack(session, &mut argocd, &client).await?;
        }

        ui::print_argocd_access(&kubeconfig.display().to_string());
        Ok(())
    }

    // ========================================================================
    // Steps 6-9: main cluster
    // ========================================================================

    async fn provision_main_cluster(&self) -> Result<()> {
        let session = self.session;

        if !session.cloud_kind().uses_capi() {
            let checkouts = Checkouts::prepare(session).await?;
            return self
                .provider()
                .provision_without_capi(session, &checkouts.cluster_dir(&session.config))
                .await;
        }

        let cluster = self.cluster_ref();
        let main_kubeconfig = session.kubeconfig(ClusterTarget::Main);
        if is_clusterctl_move_executed(&session.paths.outputs, &main_kubeconfig, &cluster).await {
            info!(cluster = %cluster.name, "Cluster API objects already moved, skipping provisioning");
            return Ok(());
        }

        let management_kubeconfig = session.kubeconfig(ClusterTarget::Management);
        let mut argocd = connect_to(&management_kubeconfig).await?;
        argocd.sync(APP_CAPI_CLUSTER, &[]).await?;

        let management = connect(&management_kubeconfig).await?;
        self.provider()
            .on_capi_cluster_synced(session, &management)
            .await?;

        let spinner = ui::spinner(format!("Waiting for cluster {} to be provisioned", cluster.name));
        let provisioned = wait_provisioned(&management, &cluster, CAPI_POLL).await;
        spinner.finish_and_clear();
        provisioned?;
        save_kubeconfig(&management, &cluster, &main_kubeconfig, KUBECONFIG_SECRET_POLL).await?;
        info!(path = %main_kubeconfig.display(), "Saved main cluster kubeconfig");
        Ok(())
    }

    async fn handover(&self) -> Result<()> {
        let main = connect(&self.session.kubeconfig(ClusterTarget::Main)).await?;

        if self.session.config.has_no_node_groups() {
            remove_control_plane_no_schedule_taints(&main).await
        } else {
            wait_ready(&main, CAPI_POLL).await
        }
    }

    async fn reseal(&self) -> Result<()> {
        let session = self.session;
        let plan = reseal_plan(session.cloud_kind(), self.state.disaster_recovery);
        if plan == ResealPlan::Skip {
            debug!("Main cluster is the management cluster, nothing to re-seal");
            return Ok(());
        }

        let mut checkouts = Checkouts::prepare(session).await?;
        let cluster_dir = checkouts.cluster_dir(&session.config);
        checkouts.config_repo.start_change(session).await?;

        let endpoint = self.main_cluster_endpoint().await;
        if let Some(endpoint) = &endpoint {
            set_cilium_endpoint(&cluster_dir, endpoint)?;
        }

        if plan == ResealPlan::EndpointAndSecrets {
            let kubeconfig = session.kubeconfig(ClusterTarget::Main);
            install_sealed_secrets(session, &kubeconfig, &checkouts.kubeaid_dir, &cluster_dir, false)
                .await?;
            let sealer = Sealer::fetch(Arc::clone(&session.runner), &kubeconfig).await?;

            let cloud_values = self.provider().template_values(session).await?;
            let values = template_values(session, cloud_values, endpoint)?;
            let selection = select_templates(&session.config, &session.flags);
            let secrets = self
                .renderer
                .render_all(&selection.secret, &values, &cluster_dir)?;
            sealer.seal_all(&secrets).await?;
        }

        checkouts
            .config_repo
            .publish(
                &session.config,
                &commit_message(session.cluster_name(), "re-sealed secrets for the main cluster"),
            )
            .await
    }

    async fn setup_main_cluster(&self) -> Result<()> {
        let session = self.session;
        let checkouts = Checkouts::prepare(session).await?;
        setup_cluster(
            session,
            &session.kubeconfig(ClusterTarget::Main),
            &checkouts.kubeaid_dir,
            &checkouts.cluster_dir(&session.config),
            self.state.disaster_recovery,
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // Steps 10-12: self-management
    // ========================================================================

    async fn pivot(&self) -> Result<()> {
        let session = self.session;
        if !session.cloud_kind().uses_capi() {
            return Ok(());
        }

        let main_kubeconfig = session.kubeconfig(ClusterTarget::Main);
        let cluster = self.cluster_ref();

        if session.flags.skip_clusterctl_move {
            info!("Skipping clusterctl move");
        } else if is_clusterctl_move_executed(&session.paths.outputs, &main_kubeconfig, &cluster).await {
            info!(cluster = %cluster.name, "Cluster API objects already moved");
            write_pivot_marker(&session.paths.outputs, &cluster.name)?;
        } else {
            self.provider().before_pivot(session, &main_kubeconfig).await?;

            let management_kubeconfig = session.kubeconfig(ClusterTarget::Management);
            let clusterctl = Clusterctl::new(Arc::clone(&session.runner));
            retry_transient(&self.retry_config, "clusterctl move", || {
                clusterctl.move_objects(&management_kubeconfig, &main_kubeconfig, &cluster.namespace)
            })
            .await?;
            write_pivot_marker(&session.paths.outputs, &cluster.name)?;
            ui::print_success("Cluster API objects moved into the main cluster");
        }

        let mut argocd = connect_to(&main_kubeconfig).await?;
        let hetzner_mode = session.config.general.cloud.hetzner.as_ref().map(|h| h.mode);
        for app in post_pivot_apps(hetzner_mode) {
            argocd.sync(app, &[]).await?;
        }
        Ok(())
    }

    async fn setup_disaster_recovery(&self) -> Result<()> {
        if self.session.config.disaster_recovery().is_none() {
            debug!("Disaster recovery not configured");
            return Ok(());
        }

        let mut argocd = connect_to(&self.session.kubeconfig(ClusterTarget::Main)).await?;
        self.provider()
            .setup_disaster_recovery(self.session, &mut argocd)
            .await
    }

    async fn sync_all(&self) -> Result<()> {
        if self.state.disaster_recovery {
            debug!("Recovering, Apps are synced after the restore");
            return Ok(());
        }

        let main_kubeconfig = self.session.kubeconfig(ClusterTarget::Main);
        let mut argocd = connect_to(&main_kubeconfig).await?;
        argocd.sync_all().await?;

        if self.session.config.disaster_recovery().is_some() {
            let main = connect(&main_kubeconfig).await?;
            velero::create_backup(&main, INITIAL_BACKUP).await?;
            velero::trigger_cron_job(&main, NAMESPACE_SEALED_SECRETS, CRONJOB_BACKUP_SEALED_SECRETS)
                .await?;
        }
        Ok(())
    }
}

/// What the reseal step changes in the cluster directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResealPlan {
    /// The main cluster is the management cluster; its secrets are already sealed for it.
    Skip,
    /// Recovered clusters restore the old controller keys, so only the endpoint moves.
    EndpointOnly,
    EndpointAndSecrets,
}

fn reseal_plan(cloud: CloudKind, disaster_recovery: bool) -> ResealPlan {
    match (cloud, disaster_recovery) {
        (CloudKind::Local, _) => ResealPlan::Skip,
        (_, true) => ResealPlan::EndpointOnly,
        (_, false) => ResealPlan::EndpointAndSecrets,
    }
}

/// Apps synced in the main cluster once it manages itself.
fn post_pivot_apps(hetzner_mode: Option<HetznerMode>) -> Vec<&'static str> {
    let mut apps = Vec::new();
    if hetzner_mode != Some(HetznerMode::BareMetal) {
        apps.push(APP_CLUSTER_AUTOSCALER);
    }
    if hetzner_mode.is_none() {
        apps.push(APP_EXTERNAL_SNAPSHOTTER);
    }
    apps
}

/// Whether a kubeconfig exists for `target`.
#[must_use]
pub fn has_kubeconfig(session: &Session, target: ClusterTarget) -> bool {
    session.kubeconfig(target).is_file()
}

/// Fail unless the main cluster kubeconfig exists.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] naming the missing file.
pub fn require_main_kubeconfig(session: &Session) -> Result<()> {
    if has_kubeconfig(session, ClusterTarget::Main) {
        return Ok(());
    }
    Err(Error::precondition(format!(
        "main cluster kubeconfig {} not found, bootstrap the cluster first",
        session.kubeconfig(ClusterTarget::Main).display()
    )))
}
