//! AWS client implementation.
//!
//! Drives the `aws` and `clusterawsadm` CLIs with credentials passed through the child
//! environment, so nothing leaks into the parent process.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::models::{
    CallerIdentity, DescribeInstanceTypesResponse, ListObjectsResponse, PolicyDocument, S3Object,
};
use crate::exec::{run_checked, CommandRunner, Invocation, SystemRunner};
use crate::providers::VmSpec;
use crate::CloudProviderError;

/// Marker line `clusterawsadm` prints before the encoded profile.
const ENCODE_AS_PROFILE_WARNING: &str =
    "WARNING: `encode-as-profile` should only be used for bootstrapping.";

/// Static AWS credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

/// AWS provider.
#[derive(Clone)]
pub struct Aws {
    runner: Arc<dyn CommandRunner>,
    credentials: AwsCredentials,
}

impl Aws {
    /// Create a provider that spawns real CLI processes.
    #[must_use]
    pub fn new(credentials: AwsCredentials) -> Self {
        Self::with_runner(credentials, Arc::new(SystemRunner))
    }

    /// Create a provider on top of a custom [`CommandRunner`].
    #[must_use]
    pub fn with_runner(credentials: AwsCredentials, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            credentials,
        }
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.credentials.region
    }

    /// Environment every AWS CLI child receives.
    #[must_use]
    pub fn credential_envs(&self) -> Vec<(String, String)> {
        let mut envs = vec![
            (
                "AWS_ACCESS_KEY_ID".to_string(),
                self.credentials.access_key_id.clone(),
            ),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.credentials.secret_access_key.clone(),
            ),
            ("AWS_REGION".to_string(), self.credentials.region.clone()),
        ];
        if let Some(token) = self.credentials.session_token.as_ref().filter(|t| !t.is_empty()) {
            envs.push(("AWS_SESSION_TOKEN".to_string(), token.clone()));
        }
        envs
    }

    fn invocation(&self, program: &str) -> Invocation {
        self.credential_envs()
            .into_iter()
            .fold(Invocation::new(program), |inv, (k, v)| inv.env(k, v))
    }

    async fn aws(&self, args: &[&str]) -> Result<String, CloudProviderError> {
        let invocation = self
            .invocation("aws")
            .args(args.iter().copied())
            .args(["--output", "json"]);
        run_checked(self.runner.as_ref(), invocation).await
    }

    async fn clusterawsadm(&self, args: &[&str]) -> Result<String, CloudProviderError> {
        let invocation = self.invocation("clusterawsadm").args(args.iter().copied());
        run_checked(self.runner.as_ref(), invocation).await
    }

    /// `clusterawsadm controller ...` against the cluster running CAPA.
    async fn controller(&self, kubeconfig: &Path, args: &[&str]) -> Result<String, CloudProviderError> {
        let invocation = self
            .invocation("clusterawsadm")
            .args(args.iter().copied())
            .env("KUBECONFIG", kubeconfig.to_string_lossy());
        run_checked(self.runner.as_ref(), invocation).await
    }

    /// Account id of the credentials in use.
    ///
    /// # Errors
    /// Returns error if the STS call fails.
    pub async fn account_id(&self) -> Result<String, CloudProviderError> {
        let output = self.aws(&["sts", "get-caller-identity"]).await?;
        let identity: CallerIdentity = serde_json::from_str(&output)?;
        Ok(identity.account)
    }

    /// CPU and memory of an EC2 instance type.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] for unknown instance types.
    pub async fn vm_spec(&self, instance_type: &str) -> Result<VmSpec, CloudProviderError> {
        let output = self
            .aws(&[
                "ec2",
                "describe-instance-types",
                "--instance-types",
                instance_type,
            ])
            .await?;
        let response: DescribeInstanceTypesResponse = serde_json::from_str(&output)?;

        let info = response
            .instance_types
            .into_iter()
            .next()
            .ok_or_else(|| CloudProviderError::NotFound(format!("instance type {instance_type}")))?;

        Ok(VmSpec {
            cpu: info.v_cpu_info.default_v_cpus,
            memory_mib: info.memory_info.size_in_mib,
            root_volume_gib: None,
        })
    }

    /// Create or update the CAPA IAM CloudFormation stack.
    ///
    /// # Errors
    /// Returns error if `clusterawsadm` fails for any reason other than the stack existing.
    pub async fn create_iam_cloudformation_stack(&self) -> Result<(), CloudProviderError> {
        match self
            .clusterawsadm(&["bootstrap", "iam", "create-cloudformation-stack"])
            .await
        {
            Ok(_) => {
                info!("Created / updated IAM CloudFormation stack");
                Ok(())
            }
            Err(CloudProviderError::Command { stderr, .. })
                if stderr.contains("already exists") || stderr.contains("updating") =>
            {
                info!("IAM CloudFormation stack already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Base64 encoded credentials profile consumed by CAPA (`AWS_B64ENCODED_CREDENTIALS`).
    ///
    /// # Errors
    /// Returns error if `clusterawsadm` fails or prints nothing usable.
    pub async fn encode_credentials_as_profile(&self) -> Result<String, CloudProviderError> {
        let output = self
            .clusterawsadm(&["bootstrap", "credentials", "encode-as-profile"])
            .await?;

        let encoded = output
            .split(ENCODE_AS_PROFILE_WARNING)
            .last()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CloudProviderError::Config("clusterawsadm printed no encoded profile".to_string())
            })?;

        Ok(encoded.to_string())
    }

    /// Remove static credentials from the CAPA controller.
    ///
    /// # Errors
    /// Returns error if `clusterawsadm` fails.
    pub async fn zero_controller_credentials(
        &self,
        kubeconfig: &Path,
        namespace: &str,
    ) -> Result<(), CloudProviderError> {
        self.controller(kubeconfig, &["controller", "zero-credentials", "--namespace", namespace])
            .await?;
        info!(namespace = %namespace, "Zeroed CAPA controller credentials");
        Ok(())
    }

    /// Restart the CAPA controller so it picks up instance-profile credentials.
    ///
    /// # Errors
    /// Returns error if `clusterawsadm` fails.
    pub async fn rollout_controller(
        &self,
        kubeconfig: &Path,
        namespace: &str,
    ) -> Result<(), CloudProviderError> {
        self.controller(kubeconfig, &["controller", "rollout-controller", "--namespace", namespace])
            .await?;
        info!(namespace = %namespace, "Rolled out CAPA controller");
        Ok(())
    }

    /// Create an S3 bucket in the configured region.
    ///
    /// A bucket already owned by the caller is accepted. A bucket name taken by another account
    /// is a configuration error.
    ///
    /// # Errors
    /// Returns error if creation fails.
    pub async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        let region = self.credentials.region.clone();
        let location = format!("LocationConstraint={region}");

        let mut args = vec!["s3api", "create-bucket", "--bucket", name, "--region", region.as_str()];
        if region != "us-east-1" {
            args.extend(["--create-bucket-configuration", location.as_str()]);
        }

        match self.aws(&args).await {
            Ok(_) => {}
            Err(CloudProviderError::Command { stderr, .. })
                if stderr.contains("BucketAlreadyOwnedByYou") =>
            {
                warn!(bucket = %name, "S3 bucket already exists and is owned by you");
                return Ok(());
            }
            Err(CloudProviderError::Command { stderr, .. })
                if stderr.contains("BucketAlreadyExists") =>
            {
                return Err(CloudProviderError::Config(format!(
                    "S3 bucket {name} is owned by another account"
                )));
            }
            Err(e) => return Err(e),
        }

        self.aws(&["s3api", "wait", "bucket-exists", "--bucket", name])
            .await?;
        info!(bucket = %name, "Created S3 bucket");
        Ok(())
    }

    /// Create an IAM policy and a role under `/<path>/`, then attach them.
    ///
    /// Existing policies and roles are reused.
    ///
    /// # Errors
    /// Returns error if any IAM call fails for a reason other than "already exists".
    pub async fn create_role_for_policy(
        &self,
        account_id: &str,
        name: &str,
        path: &str,
        policy: &PolicyDocument,
        trust_policy: &PolicyDocument,
    ) -> Result<(), CloudProviderError> {
        let iam_path = format!("/{path}/");
        let policy_json = serde_json::to_string(policy)?;
        let trust_json = serde_json::to_string(trust_policy)?;

        let created = self
            .aws(&[
                "iam",
                "create-policy",
                "--policy-name",
                name,
                "--path",
                &iam_path,
                "--policy-document",
                &policy_json,
            ])
            .await;
        tolerate_already_exists(created, "IAM policy", name)?;

        let created = self
            .aws(&[
                "iam",
                "create-role",
                "--role-name",
                name,
                "--path",
                &iam_path,
                "--assume-role-policy-document",
                &trust_json,
            ])
            .await;
        tolerate_already_exists(created, "IAM role", name)?;

        let policy_arn = format!("arn:aws:iam::{account_id}:policy{iam_path}{name}");
        self.aws(&[
            "iam",
            "attach-role-policy",
            "--role-name",
            name,
            "--policy-arn",
            &policy_arn,
        ])
        .await?;
        info!(role = %name, "Attached IAM role and policy");

        Ok(())
    }

    /// List every object in a bucket.
    ///
    /// # Errors
    /// Returns error if the listing fails.
    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<S3Object>, CloudProviderError> {
        let output = self
            .aws(&["s3api", "list-objects-v2", "--bucket", bucket])
            .await?;
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }
        let response: ListObjectsResponse = serde_json::from_str(&output)?;
        Ok(response.contents)
    }

    /// Download one object to `destination`.
    ///
    /// # Errors
    /// Returns error if the copy fails.
    pub async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), CloudProviderError> {
        let source = format!("s3://{bucket}/{key}");
        let destination = destination.to_string_lossy();
        debug!(source = %source, destination = %destination, "Downloading S3 object");

        let invocation = self
            .invocation("aws")
            .args(["s3", "cp", "--only-show-errors", source.as_str(), destination.as_ref()]);
        run_checked(self.runner.as_ref(), invocation).await?;
        Ok(())
    }
}

fn tolerate_already_exists(
    result: Result<String, CloudProviderError>,
    kind: &str,
    name: &str,
) -> Result<(), CloudProviderError> {
    match result {
        Ok(_) => {
            info!(name = %name, "Created {kind}");
            Ok(())
        }
        Err(CloudProviderError::Command { stderr, .. }) if stderr.contains("EntityAlreadyExists") || stderr.contains("already exists") => {
            info!(name = %name, "{kind} already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use crate::providers::aws::PolicyStatement;

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: "eu-west-1".into(),
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, CloudProviderError> {
        Ok(CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(stderr: &str) -> Result<CommandOutput, CloudProviderError> {
        Ok(CommandOutput {
            status: 254,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[tokio::test]
    async fn test_vm_spec_parses_instance_type() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.program == "aws"
                    && inv.args.contains(&"describe-instance-types".to_string())
                    && inv.envs.contains(&("AWS_REGION".to_string(), "eu-west-1".to_string()))
            })
            .returning(|_| {
                ok(r#"{"InstanceTypes":[{"InstanceType":"t3.large","VCpuInfo":{"DefaultVCpus":2},"MemoryInfo":{"SizeInMiB":8192}}]}"#)
            });

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        let spec = aws.vm_spec("t3.large").await.unwrap();
        assert_eq!(spec.cpu, 2);
        assert_eq!(spec.memory_mib, 8192);
    }

    #[tokio::test]
    async fn test_encode_credentials_strips_warning() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            ok("WARNING: `encode-as-profile` should only be used for bootstrapping.\n\nW2RlZmF1bHRd\n")
        });

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        assert_eq!(aws.encode_credentials_as_profile().await.unwrap(), "W2RlZmF1bHRd");
    }

    #[tokio::test]
    async fn test_create_bucket_accepts_owned_bucket() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.args.contains(&"create-bucket".to_string()))
            .times(1)
            .returning(|_| failed("An error occurred (BucketAlreadyOwnedByYou)"));

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        aws.create_bucket("velero-backups").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_bucket_rejects_foreign_bucket() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| failed("An error occurred (BucketAlreadyExists)"));

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        let err = aws.create_bucket("velero-backups").await.unwrap_err();
        assert!(matches!(err, CloudProviderError::Config(_)));
    }

    #[tokio::test]
    async fn test_create_role_for_policy_reuses_existing() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.args.contains(&"create-policy".to_string()))
            .returning(|_| failed("EntityAlreadyExists: A policy called velero-prod already exists"));
        runner
            .expect_run()
            .withf(|inv| inv.args.contains(&"create-role".to_string()))
            .returning(|_| ok("{}"));
        runner
            .expect_run()
            .withf(|inv| {
                inv.args.contains(&"attach-role-policy".to_string())
                    && inv
                        .args
                        .contains(&"arn:aws:iam::123456789012:policy/prod/velero-prod".to_string())
            })
            .times(1)
            .returning(|_| ok(""));

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        let policy = PolicyDocument::new(vec![PolicyStatement::allow(
            &["s3:ListBucket"],
            "arn:aws:s3:::velero",
        )]);
        aws.create_role_for_policy("123456789012", "velero-prod", "prod", &policy, &policy)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_objects_of_empty_bucket() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| ok(""));

        let aws = Aws::with_runner(credentials(), Arc::new(runner));
        assert!(aws.list_objects("empty").await.unwrap().is_empty());
    }
}
