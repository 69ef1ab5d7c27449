//! Hetzner: HCloud servers, dedicated servers managed through Robot, or both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{DynamicObject, ListParams};
use kube::Client;
use kubeaid_cloud::{HCloud, Robot};
use tracing::{debug, info};

use super::{
    recreate_machine_template, set_json_path, CloudProvider, InfrastructureRef,
    MachineImageUpdates,
};
use crate::config::{CloudKind, Config, HetznerMode};
use crate::constants::{
    ANNOTATION_HETZNER_BARE_METAL_HOST, HETZNER_POLL, HETZNER_VSWITCH_GATEWAY_IP,
    HETZNER_VSWITCH_SUBNET_CIDR, LABEL_CAPI_CONTROL_PLANE,
};
use crate::error::{Error, Result};
use crate::k8s::resources::{
    hetzner_bare_metal_host, hetzner_bare_metal_machine, hetzner_cluster, namespaced,
};
use crate::session::Session;
use crate::templates::set_yaml_path;

const KIND_HCLOUD_MACHINE_TEMPLATE: &str = "HCloudMachineTemplate";
const KIND_BARE_METAL_MACHINE_TEMPLATE: &str = "HetznerBareMetalMachineTemplate";

pub struct HetznerProvider {
    hcloud: HCloud,
    robot: Option<Robot>,
}

impl HetznerProvider {
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the API token is missing, or the Robot credentials are
    /// missing while dedicated servers are in use.
    pub fn from_config(config: &Config) -> Result<Self> {
        let hetzner = config.hetzner()?;
        let credentials = config
            .secrets
            .hetzner
            .as_ref()
            .ok_or_else(|| Error::config("hetzner credentials are missing from secrets.yaml"))?;

        let hcloud = HCloud::new(credentials.api_token.clone())?;
        let robot = match credentials.robot.as_ref() {
            Some(robot) => Some(Robot::new(robot.user.clone(), robot.password.clone())?),
            None if hetzner.using_bare_metal() => {
                return Err(Error::config(format!(
                    "hetzner.robot credentials are required in {} mode",
                    hetzner.mode.as_str()
                )))
            }
            None => None,
        };

        Ok(Self { hcloud, robot })
    }

    fn robot(&self) -> Result<&Robot> {
        self.robot
            .as_ref()
            .ok_or_else(|| Error::config("hetzner.robot credentials are missing"))
    }

    /// Point the control plane failover IP at the first master the provider installed.
    async fn route_failover_ip(
        &self,
        session: &Session,
        management: &Client,
        failover_ip: &str,
    ) -> Result<()> {
        let namespace = session.config.capi_namespace();
        let machines = namespaced(management, &namespace, &hetzner_bare_metal_machine());
        let hosts = namespaced(management, &namespace, &hetzner_bare_metal_host());

        info!(failover_ip = %failover_ip, "Waiting for the initial control plane host");
        let server_ip = loop {
            let listed = machines.list(&ListParams::default()).await?;
            if let Some((host_namespace, host_name)) =
                init_master_machine(&listed.items).and_then(host_reference)
            {
                let hosts = if host_namespace == namespace {
                    hosts.clone()
                } else {
                    namespaced(management, &host_namespace, &hetzner_bare_metal_host())
                };
                if let Some(host) = hosts.get_opt(&host_name).await? {
                    if let Some(ip) = host
                        .data
                        .pointer("/spec/status/ipv4")
                        .and_then(|ip| ip.as_str())
                        .filter(|ip| !ip.is_empty())
                    {
                        break ip.to_string();
                    }
                }
                debug!(host = %host_name, "Initial control plane host has no IPv4 yet");
            }
            tokio::time::sleep(HETZNER_POLL).await;
        };

        self.robot()?.route_failover(failover_ip, &server_ip).await?;
        info!(failover_ip = %failover_ip, server_ip = %server_ip, "Routed failover IP to the initial control plane host");
        Ok(())
    }

    /// Connect the Robot VSwitch to the HCloud network CAPH created for the cluster.
    async fn connect_vswitch(
        &self,
        session: &Session,
        management: &Client,
        name: &str,
        vlan_id: u32,
    ) -> Result<()> {
        let namespace = session.config.capi_namespace();
        let clusters = namespaced(management, &namespace, &hetzner_cluster());
        let cluster = session.cluster_name();

        info!(cluster = %cluster, "Waiting for the HCloud network");
        let network_id = loop {
            if let Some(id) = clusters
                .get_opt(cluster)
                .await?
                .as_ref()
                .and_then(network_id)
            {
                break id;
            }
            tokio::time::sleep(HETZNER_POLL).await;
        };

        let vswitch_id = self.robot()?.ensure_vswitch(name, vlan_id).await?;
        self.hcloud
            .attach_vswitch(
                network_id,
                vswitch_id,
                HETZNER_VSWITCH_SUBNET_CIDR,
                HETZNER_VSWITCH_GATEWAY_IP,
            )
            .await?;
        Ok(())
    }
}

/// The oldest control plane HetznerBareMetalMachine, which hosts the first master.
fn init_master_machine(machines: &[DynamicObject]) -> Option<&DynamicObject> {
    machines
        .iter()
        .filter(|machine| {
            machine
                .metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(LABEL_CAPI_CONTROL_PLANE))
        })
        .min_by_key(|machine| {
            machine
                .metadata
                .creation_timestamp
                .as_ref()
                .map_or(DateTime::<Utc>::MAX_UTC, |time| time.0)
        })
}

/// The `namespace/name` of the HetznerBareMetalHost a machine was scheduled on.
fn host_reference(machine: &DynamicObject) -> Option<(String, String)> {
    let annotation = machine
        .metadata
        .annotations
        .as_ref()?
        .get(ANNOTATION_HETZNER_BARE_METAL_HOST)?;
    parse_host_annotation(annotation)
}

fn parse_host_annotation(value: &str) -> Option<(String, String)> {
    let (namespace, name) = value.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

fn network_id(cluster: &DynamicObject) -> Option<u64> {
    cluster
        .data
        .pointer("/status/network/id")
        .and_then(serde_json::Value::as_u64)
        .filter(|id| *id != 0)
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn kind(&self) -> CloudKind {
        CloudKind::Hetzner
    }

    async fn hydrate_vm_specs(&self, config: &mut Config) -> Result<()> {
        let Some(hetzner) = config.general.cloud.hetzner.as_mut() else {
            return Ok(());
        };
        for node_group in &mut hetzner.node_groups.hcloud {
            let spec = self.hcloud.vm_spec(&node_group.machine_type).await?;
            node_group.autoscaling.cpu = spec.cpu;
            node_group.autoscaling.memory = spec.memory_gib();
            node_group.root_volume_size = spec.root_volume_gib.unwrap_or(0);
        }
        Ok(())
    }

    async fn setup_prerequisites(&self, session: &Session) -> Result<()> {
        let hetzner = session.config.hetzner()?;
        if let (true, Some(vswitch)) = (hetzner.using_bare_metal(), hetzner.vswitch.as_ref()) {
            let id = self
                .robot()?
                .ensure_vswitch(&vswitch.name, vswitch.vlan_id)
                .await?;
            info!(vswitch = %vswitch.name, id, "Ensured Hetzner VSwitch");
        }
        Ok(())
    }

    async fn on_capi_cluster_synced(&self, session: &Session, management: &Client) -> Result<()> {
        let hetzner = session.config.hetzner()?;

        if let Some(failover_ip) = hetzner.control_plane_failover_ip() {
            self.route_failover_ip(session, management, failover_ip)
                .await?;
        }

        if let (HetznerMode::Hybrid, Some(vswitch)) = (hetzner.mode, hetzner.vswitch.as_ref()) {
            self.connect_vswitch(session, management, &vswitch.name, vswitch.vlan_id)
                .await?;
        }
        Ok(())
    }

    async fn update_machine_template(
        &self,
        client: &Client,
        namespace: &str,
        template: &InfrastructureRef,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        let (pointer, value) = match template.kind.as_str() {
            KIND_HCLOUD_MACHINE_TEMPLATE => ("/spec/template/spec/imageName", &updates.image_name),
            KIND_BARE_METAL_MACHINE_TEMPLATE => (
                "/spec/template/spec/installImage/image/path",
                &updates.image_path,
            ),
            other => {
                return Err(Error::Unsupported(format!(
                    "machine template kind {other} on Hetzner"
                )))
            }
        };
        let Some(value) = value.clone() else {
            debug!(kind = %template.kind, name = %template.name, "No image update for machine template");
            return Ok(());
        };

        recreate_machine_template(client, namespace, template, move |object| {
            set_json_path(object, pointer, &value)
        })
        .await
    }

    fn update_values_file(
        &self,
        document: &mut serde_yaml::Value,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        if let Some(name) = updates.image_name.as_deref() {
            set_yaml_path(document, &["hetzner", "hcloud", "imageName"], name.into())?;
        }
        if let Some(path) = updates.image_path.as_deref() {
            set_yaml_path(
                document,
                &["hetzner", "bareMetal", "installImage", "imagePath"],
                path.into(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate::{render_sample, SampleKind};
    use crate::config::test_config;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn machine(name: &str, created: &str, control_plane: bool, host: Option<&str>) -> DynamicObject {
        let mut object = DynamicObject::new(name, &hetzner_bare_metal_machine());
        object.metadata.creation_timestamp =
            Some(Time(created.parse::<DateTime<Utc>>().unwrap()));
        if control_plane {
            object.metadata.labels = Some(BTreeMap::from([(
                LABEL_CAPI_CONTROL_PLANE.to_string(),
                String::new(),
            )]));
        }
        if let Some(host) = host {
            object.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_HETZNER_BARE_METAL_HOST.to_string(),
                host.to_string(),
            )]));
        }
        object
    }

    #[test]
    fn test_init_master_is_oldest_control_plane_machine() {
        let machines = vec![
            machine("worker", "2026-01-01T00:00:00Z", false, Some("capi-cluster/bm-9")),
            machine("cp-b", "2026-01-01T00:05:00Z", true, Some("capi-cluster/bm-2")),
            machine("cp-a", "2026-01-01T00:01:00Z", true, Some("capi-cluster/bm-1")),
        ];
        let init = init_master_machine(&machines).unwrap();
        assert_eq!(init.metadata.name.as_deref(), Some("cp-a"));
        assert_eq!(
            host_reference(init),
            Some(("capi-cluster".to_string(), "bm-1".to_string()))
        );
    }

    #[test]
    fn test_init_master_needs_control_plane_machines() {
        let machines = vec![machine("worker", "2026-01-01T00:00:00Z", false, None)];
        assert!(init_master_machine(&machines).is_none());
    }

    #[test]
    fn test_parse_host_annotation() {
        assert_eq!(
            parse_host_annotation("capi-cluster-acme/bm-1"),
            Some(("capi-cluster-acme".to_string(), "bm-1".to_string()))
        );
        assert_eq!(parse_host_annotation("bm-1"), None);
        assert_eq!(parse_host_annotation("/bm-1"), None);
    }

    #[test]
    fn test_network_id_ignores_unset() {
        let mut cluster = DynamicObject::new("kubeaid-demo", &hetzner_cluster());
        assert_eq!(network_id(&cluster), None);
        cluster.data = serde_json::json!({ "status": { "network": { "id": 4711 } } });
        assert_eq!(network_id(&cluster), Some(4711));
    }

    #[test]
    fn test_bare_metal_requires_robot_credentials() {
        let (general, _) = render_sample(SampleKind::Hetzner(HetznerMode::BareMetal)).unwrap();
        let config = test_config(&general, "hetzner:\n  apiToken: token\n");
        let err = HetznerProvider::from_config(&config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let (general, secrets) =
            render_sample(SampleKind::Hetzner(HetznerMode::BareMetal)).unwrap();
        let config = test_config(&general, &secrets);
        assert!(HetznerProvider::from_config(&config).unwrap().robot.is_some());
    }

    #[test]
    fn test_hcloud_only_needs_no_robot() {
        let (general, _) = render_sample(SampleKind::Hetzner(HetznerMode::Hcloud)).unwrap();
        let config = test_config(&general, "hetzner:\n  apiToken: token\n");
        assert!(HetznerProvider::from_config(&config).unwrap().robot.is_none());
    }

    #[test]
    fn test_values_file_update() {
        let (general, secrets) = render_sample(SampleKind::Hetzner(HetznerMode::Hybrid)).unwrap();
        let provider = HetznerProvider::from_config(&test_config(&general, &secrets)).unwrap();
        let mut document: serde_yaml::Value =
            serde_yaml::from_str("hetzner:\n  hcloud:\n    imageName: ubuntu-22.04\n").unwrap();

        provider
            .update_values_file(
                &mut document,
                &MachineImageUpdates {
                    image_name: Some("ubuntu-24.04".into()),
                    image_path: Some("/root/images/noble.tar.gz".into()),
                    ..MachineImageUpdates::default()
                },
            )
            .unwrap();

        assert_eq!(document["hetzner"]["hcloud"]["imageName"], "ubuntu-24.04");
        assert_eq!(
            document["hetzner"]["bareMetal"]["installImage"]["imagePath"],
            "/root/images/noble.tar.gz"
        );
    }
}
