//! `cluster test`: a minimal Cilium connectivity check of the main cluster.

use kubeaid_cloud::{run_checked, Invocation};
use tracing::info;

use super::require_main_kubeconfig;
use crate::constants::{ENV_KUBECONFIG, NAMESPACE_CILIUM, NAMESPACE_CILIUM_TEST};
use crate::error::Result;
use crate::k8s::{connect, ensure_namespace};
use crate::session::{ensure_executables, ClusterTarget, Session};
use crate::ui;

const CILIUM_CLI: &str = "cilium-cli";

/// Test pods run DNS lookups and tcpdumps.
const LABEL_PRIVILEGED: &str = "pod-security.kubernetes.io/enforce=privileged";

fn connectivity_test(kubeconfig: &str) -> Invocation {
    Invocation::new(CILIUM_CLI)
        .args([
            "connectivity",
            "test",
            "--namespace",
            NAMESPACE_CILIUM,
            "--test-namespace",
            NAMESPACE_CILIUM_TEST,
            "--test",
            "!",
            "--timeout",
            "5m",
        ])
        .env(ENV_KUBECONFIG, kubeconfig)
}

/// Run the Cilium connectivity test in a privileged namespace, then clean up after it.
///
/// # Errors
///
/// Returns [`crate::Error::Config`] when `cilium-cli` is missing, or the failing test.
pub async fn test_cluster(session: &Session) -> Result<()> {
    ensure_executables(&[CILIUM_CLI])?;
    require_main_kubeconfig(session)?;

    let kubeconfig = session.kubeconfig(ClusterTarget::Main);
    let kubectl = session.kubectl(&kubeconfig);
    ui::print_section("Running Cilium connectivity tests");

    let client = connect(&kubeconfig).await?;
    ensure_namespace(&client, NAMESPACE_CILIUM_TEST).await?;
    kubectl
        .label_namespace(NAMESPACE_CILIUM_TEST, LABEL_PRIVILEGED)
        .await?;

    run_checked(
        session.runner.as_ref(),
        connectivity_test(&kubeconfig.display().to_string()),
    )
    .await?;
    info!("Cilium connectivity tests passed");

    let second_namespace = format!("{NAMESPACE_CILIUM_TEST}-1");
    kubectl
        .exec(&[
            "delete",
            "namespace",
            NAMESPACE_CILIUM_TEST,
            &second_namespace,
            "--ignore-not-found",
        ])
        .await?;

    ui::print_success("Cilium connectivity tests passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_test_invocation() {
        let invocation = connectivity_test("outputs/kubeconfigs/clusters/main.yaml");
        assert_eq!(invocation.program, "cilium-cli");
        assert_eq!(
            invocation.args.join(" "),
            "connectivity test --namespace cilium --test-namespace cilium-test --test ! --timeout 5m"
        );
        assert_eq!(
            invocation.envs,
            vec![(
                "KUBECONFIG".to_string(),
                "outputs/kubeconfigs/clusters/main.yaml".to_string()
            )]
        );
    }
}
