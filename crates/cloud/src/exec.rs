//! External CLI execution.
//!
//! The AWS and Azure integrations drive the vendor CLIs (`aws`, `clusterawsadm`, `az`, `azwi`)
//! rather than the REST APIs directly. Every invocation goes through [`CommandRunner`], so
//! callers can be tested against `MockCommandRunner`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::CloudProviderError;

/// A single CLI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub stdin: Option<String>,
    /// Arguments carry secrets and must not be logged.
    pub sensitive: bool,
}

impl Invocation {
    /// Start building an invocation of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the child's stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Hide the arguments from logs.
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Human readable command line, for logs.
    #[must_use]
    pub fn display(&self) -> String {
        if self.sensitive {
            return format!("{} <redacted>", self.program);
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes CLI invocations.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation to completion, capturing its output.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be spawned or awaited. A non-zero exit
    /// status is reported through [`CommandOutput::status`].
    async fn run(&self, invocation: Invocation) -> Result<CommandOutput, CloudProviderError>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: Invocation) -> Result<CommandOutput, CloudProviderError> {
        debug!(command = %invocation.display(), "Executing command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        if let (Some(input), Some(mut stdin)) = (invocation.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run an invocation and return its stdout, failing on a non-zero exit status.
///
/// # Errors
///
/// Returns [`CloudProviderError::Command`] carrying the child's stderr when it exits
/// unsuccessfully.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: Invocation,
) -> Result<String, CloudProviderError> {
    let program = invocation.program.clone();
    let output = runner.run(invocation).await?;

    if output.success() {
        Ok(output.stdout)
    } else {
        Err(CloudProviderError::Command {
            program,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let invocation = Invocation::new("aws")
            .args(["s3api", "head-bucket"])
            .args(["--bucket", "backups"]);
        assert_eq!(invocation.display(), "aws s3api head-bucket --bucket backups");

        let login = Invocation::new("az")
            .args(["login", "--password", "hunter2"])
            .sensitive();
        assert_eq!(login.display(), "az <redacted>");
    }

    #[tokio::test]
    async fn test_run_checked_surfaces_stderr() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: 254,
                stdout: String::new(),
                stderr: "AccessDenied\n".into(),
            })
        });

        let err = run_checked(&runner, Invocation::new("aws"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "aws failed: AccessDenied");
    }

    #[tokio::test]
    async fn test_system_runner_pipes_stdin() {
        let output = SystemRunner
            .run(Invocation::new("cat").stdin("hello"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }
}
