//! Kube API server audit logging defaults.

use super::model::{ClusterConfig, FileConfig, HostPathMount};

pub const FLAG_AUDIT_POLICY_FILE: &str = "audit-policy-file";
pub const FLAG_AUDIT_LOG_PATH: &str = "audit-log-path";

pub const DEFAULT_AUDIT_POLICY_PATH: &str = "/srv/kubernetes/audit.yaml";
pub const DEFAULT_AUDIT_LOG_PATH: &str = "/var/log/kube-apiserver-audit.logs";

const HOST_PATH_FILE_OR_CREATE: &str = "FileOrCreate";

/// Policy written to the control plane nodes when the user brings none.
pub const DEFAULT_AUDIT_POLICY: &str = include_str!("../../templates/audit-policy.yaml");

fn default_extra_args() -> [(&'static str, &'static str); 5] {
    [
        ("audit-log-maxage", "10"),
        ("audit-log-maxbackup", "1"),
        ("audit-log-maxsize", "100"),
        (FLAG_AUDIT_POLICY_FILE, DEFAULT_AUDIT_POLICY_PATH),
        (FLAG_AUDIT_LOG_PATH, DEFAULT_AUDIT_LOG_PATH),
    ]
}

/// Fill in whatever audit logging piece the user left out: API server flags, the policy file
/// and the host path mounts for the policy and the log backend.
///
/// User provided values always win. Running this twice changes nothing.
pub fn hydrate_audit_logging(cluster: &mut ClusterConfig) {
    if !cluster.enable_audit_logging {
        return;
    }

    let api_server = &mut cluster.api_server;

    for (flag, value) in default_extra_args() {
        api_server
            .extra_args
            .entry(flag.to_string())
            .or_insert_with(|| value.to_string());
    }

    let policy_path = api_server
        .extra_args
        .get(FLAG_AUDIT_POLICY_FILE)
        .cloned()
        .unwrap_or_else(|| DEFAULT_AUDIT_POLICY_PATH.to_string());

    if !api_server.files.iter().any(|file| file.path == policy_path) {
        api_server.files.push(FileConfig {
            path: policy_path.clone(),
            content: DEFAULT_AUDIT_POLICY.to_string(),
        });
    }

    ensure_mounted(
        &mut api_server.extra_volumes,
        HostPathMount {
            name: FLAG_AUDIT_POLICY_FILE.to_string(),
            host_path: policy_path.clone(),
            mount_path: policy_path,
            path_type: HOST_PATH_FILE_OR_CREATE.to_string(),
            read_only: true,
        },
    );

    if let Some(log_path) = api_server.extra_args.get(FLAG_AUDIT_LOG_PATH).cloned() {
        ensure_mounted(
            &mut api_server.extra_volumes,
            HostPathMount {
                name: "log-backend".to_string(),
                host_path: log_path.clone(),
                mount_path: log_path,
                path_type: HOST_PATH_FILE_OR_CREATE.to_string(),
                read_only: false,
            },
        );
    }
}

fn ensure_mounted(volumes: &mut Vec<HostPathMount>, volume: HostPathMount) {
    if !volumes.iter().any(|v| v.host_path == volume.host_path) {
        volumes.push(volume);
    }
}
