//! AWS: CAPA IAM bootstrap, S3 + kube2iam backed disaster recovery, AMI upgrades.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use kube::Client;
use kubeaid_cloud::aws::{AwsCredentials, PolicyDocument, PolicyStatement};
use kubeaid_cloud::{Aws, CommandRunner};
use tracing::{debug, info};

use super::{
    recreate_machine_template, set_json_path, CloudProvider, InfrastructureRef,
    MachineImageUpdates,
};
use crate::argocd::ArgoCd;
use crate::config::{CloudKind, Config, DisasterRecoveryConfig};
use crate::constants::{
    APP_K8S_CONFIGS, APP_KUBE2IAM, APP_SEALED_SECRETS, APP_VELERO, GZIP_SUFFIX,
};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::templates::{set_yaml_path, CloudTemplateValues};

/// Role CAPA attaches to every node's instance profile.
const NODES_ROLE: &str = "nodes.cluster-api-provider-aws.sigs.k8s.io";

pub struct AwsProvider {
    aws: Aws,
}

impl AwsProvider {
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the AWS section or credentials are missing.
    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let region = config.aws()?.region.clone();
        let credentials = config
            .secrets
            .aws
            .as_ref()
            .ok_or_else(|| Error::config("AWS credentials not found in secrets or environment"))?;

        let aws = Aws::with_runner(
            AwsCredentials {
                access_key_id: credentials.access_key_id.clone(),
                secret_access_key: credentials.secret_access_key.clone(),
                session_token: credentials.session_token.clone(),
                region,
            },
            runner,
        );
        Ok(Self { aws })
    }

    #[must_use]
    pub fn client(&self) -> &Aws {
        &self.aws
    }
}

fn trust_policy(account_id: &str) -> PolicyDocument {
    let mut statement = PolicyStatement::allow(&["sts:AssumeRole"], String::new());
    statement.resource = None;
    statement.principal = Some(
        [(
            "AWS".to_string(),
            format!("arn:aws:iam::{account_id}:role/{NODES_ROLE}"),
        )]
        .into(),
    );
    PolicyDocument::new(vec![statement])
}

fn sealed_secrets_backuper_policy(dr: &DisasterRecoveryConfig) -> PolicyDocument {
    PolicyDocument::new(vec![PolicyStatement::allow(
        &[
            "s3:PutObject",
            "s3:AbortMultipartUpload",
            "s3:ListMultipartUploadParts",
        ],
        format!("arn:aws:s3:::{}/*", dr.sealed_secrets_backups_bucket_name),
    )])
}

fn velero_policy(dr: &DisasterRecoveryConfig) -> PolicyDocument {
    let bucket = &dr.velero_backups_bucket_name;
    PolicyDocument::new(vec![
        PolicyStatement::allow(
            &[
                "ec2:DescribeVolumes",
                "ec2:DescribeSnapshots",
                "ec2:CreateTags",
                "ec2:CreateVolume",
                "ec2:CreateSnapshot",
                "ec2:DeleteSnapshot",
                "ec2:CopySnapshot",
            ],
            "*",
        ),
        PolicyStatement::allow(
            &[
                "s3:GetObject",
                "s3:DeleteObject",
                "s3:PutObject",
                "s3:AbortMultipartUpload",
                "s3:ListMultipartUploadParts",
            ],
            format!("arn:aws:s3:::{bucket}/*"),
        ),
        PolicyStatement::allow(&["s3:ListBucket"], format!("arn:aws:s3:::{bucket}")),
    ])
}

/// Gunzip `source` into `destination` and remove `source`.
fn decompress(source: &Path, destination: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(File::open(source)?);
    let mut output = File::create(destination)?;
    io::copy(&mut decoder, &mut output)?;
    std::fs::remove_file(source)?;
    Ok(())
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn kind(&self) -> CloudKind {
        CloudKind::Aws
    }

    async fn hydrate_vm_specs(&self, config: &mut Config) -> Result<()> {
        let Some(aws) = config.general.cloud.aws.as_mut() else {
            return Ok(());
        };
        for node_group in &mut aws.node_groups {
            let spec = self.aws.vm_spec(&node_group.instance_type).await?;
            node_group.autoscaling.cpu = spec.cpu;
            node_group.autoscaling.memory = spec.memory_gib();
            debug!(
                node_group = %node_group.autoscaling.node_group.name,
                cpu = spec.cpu,
                memory_gib = spec.memory_gib(),
                "Hydrated node group size"
            );
        }
        Ok(())
    }

    async fn setup_prerequisites(&self, _session: &Session) -> Result<()> {
        self.aws.create_iam_cloudformation_stack().await?;
        Ok(())
    }

    async fn template_values(&self, _session: &Session) -> Result<CloudTemplateValues> {
        Ok(CloudTemplateValues {
            aws_account_id: Some(self.aws.account_id().await?),
            aws_b64_encoded_credentials: Some(self.aws.encode_credentials_as_profile().await?),
            ..CloudTemplateValues::default()
        })
    }

    async fn before_pivot(&self, session: &Session, main_kubeconfig: &Path) -> Result<()> {
        let namespace = session.config.capi_namespace();
        self.aws
            .zero_controller_credentials(main_kubeconfig, &namespace)
            .await?;
        self.aws.rollout_controller(main_kubeconfig, &namespace).await?;
        Ok(())
    }

    async fn setup_disaster_recovery(&self, session: &Session, argocd: &mut ArgoCd) -> Result<()> {
        let dr = session
            .config
            .disaster_recovery()
            .ok_or_else(|| Error::config("cloud.disasterRecovery section is missing"))?;
        let cluster = session.cluster_name();
        info!("Setting up disaster recovery");

        self.aws
            .create_bucket(&dr.sealed_secrets_backups_bucket_name)
            .await?;
        self.aws.create_bucket(&dr.velero_backups_bucket_name).await?;

        let account_id = self.aws.account_id().await?;
        let trust = trust_policy(&account_id);
        self.aws
            .create_role_for_policy(
                &account_id,
                &format!("sealed-secrets-backuper-{cluster}"),
                cluster,
                &sealed_secrets_backuper_policy(dr),
                &trust,
            )
            .await?;
        self.aws
            .create_role_for_policy(
                &account_id,
                &format!("velero-{cluster}"),
                cluster,
                &velero_policy(dr),
                &trust,
            )
            .await?;

        for app in [APP_KUBE2IAM, APP_K8S_CONFIGS, APP_VELERO, APP_SEALED_SECRETS] {
            argocd.sync(app, &[]).await?;
        }
        Ok(())
    }

    async fn download_sealed_secrets_backups(
        &self,
        session: &Session,
        destination: &Path,
    ) -> Result<usize> {
        let dr = session
            .config
            .disaster_recovery()
            .ok_or_else(|| Error::config("cloud.disasterRecovery section is missing"))?;
        let bucket = &dr.sealed_secrets_backups_bucket_name;
        std::fs::create_dir_all(destination)?;

        let mut written = 0;
        for object in self.aws.list_objects(bucket).await? {
            if object.key.ends_with('/') {
                continue;
            }
            let downloaded = destination.join(&object.key);
            if let Some(parent) = downloaded.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.aws.download_object(bucket, &object.key, &downloaded).await?;

            if object.key.ends_with(GZIP_SUFFIX) {
                decompress(&downloaded, &restored_key_path(destination, &object.key))?;
            }
            written += 1;
        }

        info!(bucket = %bucket, keys = written, "Downloaded Sealed Secrets key backups");
        Ok(written)
    }

    async fn update_machine_template(
        &self,
        client: &Client,
        namespace: &str,
        template: &InfrastructureRef,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        let Some(ami_id) = updates.ami_id.clone() else {
            return Ok(());
        };
        recreate_machine_template(client, namespace, template, move |object| {
            set_json_path(object, "/spec/template/spec/ami/id", &ami_id)
        })
        .await
    }

    fn update_values_file(
        &self,
        document: &mut serde_yaml::Value,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        let Some(ami_id) = updates.ami_id.as_deref() else {
            return Ok(());
        };
        set_yaml_path(
            document,
            &["aws", "controlPlane", "ami", "id"],
            ami_id.into(),
        )?;

        if let Some(node_groups) = document
            .get_mut("aws")
            .and_then(|aws| aws.get_mut("nodeGroups"))
            .and_then(serde_yaml::Value::as_sequence_mut)
        {
            for node_group in node_groups {
                set_yaml_path(node_group, &["ami", "id"], ami_id.into())?;
            }
        }
        Ok(())
    }
}

/// Where the unpacked key of backup object `key` lands.
#[must_use]
pub fn restored_key_path(destination: &Path, key: &str) -> PathBuf {
    destination.join(key.strip_suffix(GZIP_SUFFIX).unwrap_or(key))
}
