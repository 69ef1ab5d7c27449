//! KubeAid and KubeAid-Config repository handling through the `git` CLI.
//!
//! Authentication is injected per invocation through the child environment: an SSH key with an
//! optional passphrase (answered by an askpass helper), HTTP basic auth (an `Authorization`
//! header set through `GIT_CONFIG_*`), or the caller's SSH agent.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kubeaid_cloud::{run_checked, CloudProviderError, CommandRunner, Invocation};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{ENV_SSH_AUTH_SOCK, GIT_AUTHOR_EMAIL, GIT_AUTHOR_NAME, GIT_MERGE_POLL};
use crate::error::{Error, Result};
use crate::ui;

const ASKPASS_SCRIPT: &str = "git-askpass.sh";
const ENV_PASSPHRASE: &str = "KUBEAID_GIT_SSH_PASSPHRASE";

/// How to authenticate against the customer's git server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAuth {
    SshKey {
        private_key_path: PathBuf,
        username: String,
        passphrase: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
    SshAgent,
}

impl GitAuth {
    /// An SSH key wins over basic auth, which wins over the SSH agent.
    #[must_use]
    pub fn detect(config: &Config) -> Self {
        let git = &config.general.git;
        let credentials = config.secrets.git.as_ref();
        let password = credentials
            .map(|c| c.password.clone())
            .filter(|p| !p.is_empty());

        if let (Some(path), false) = (&git.private_key_file_path, git.use_ssh_agent) {
            info!("Using SSH private key for git");
            return Self::SshKey {
                private_key_path: path.clone(),
                username: git.ssh_username.clone(),
                passphrase: password,
            };
        }

        if let (Some(password), false) = (password, git.use_ssh_agent) {
            info!("Using username and password for git");
            return Self::Basic {
                username: credentials.map(|c| c.username.clone()).unwrap_or_default(),
                password,
            };
        }

        if std::env::var_os(ENV_SSH_AUTH_SOCK).is_none() {
            warn!("No git credentials configured and SSH_AUTH_SOCK is unset, git operations may fail");
        }
        info!("Using SSH agent for git");
        Self::SshAgent
    }
}

/// Host, owner path and name of a git repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepoLocation {
    /// Parse `https://host/owner/repo(.git)`, `ssh://user@host[:port]/owner/repo.git` or
    /// `user@host:owner/repo.git`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for URLs without an owner and a repository name.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || Error::config(format!("unsupported git URL {url}"));

        let (host, path) = if let Ok(parsed) = url::Url::parse(url) {
            if parsed.cannot_be_a_base() {
                return Err(invalid());
            }
            let host = parsed.host_str().ok_or_else(invalid)?.to_string();
            (host, parsed.path().trim_start_matches('/').to_string())
        } else {
            // scp-like syntax.
            let (user_host, path) = url.split_once(':').ok_or_else(invalid)?;
            let host = user_host.rsplit('@').next().ok_or_else(invalid)?;
            (host.to_string(), path.to_string())
        };

        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let (owner, name) = path.rsplit_once('/').ok_or_else(invalid)?;
        if host.is_empty() || owner.is_empty() || name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Where the repository is cloned below `root`.
    #[must_use]
    pub fn clone_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.host).join(&self.owner).join(&self.name)
    }

    /// Browser URL for opening a PR from `branch` into `base`.
    #[must_use]
    pub fn compare_url(&self, base: &str, branch: &str) -> String {
        let repo = self.owner.rsplit('/').next().unwrap_or(&self.owner);
        format!(
            "https://{}/{}/{}/compare/{base}...{repo}:{}:{branch}",
            self.host, self.owner, self.name, self.name
        )
    }
}

/// A local clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub url: String,
    pub dir: PathBuf,
    pub default_branch: String,
    /// Whether git operations against the remote carry credentials.
    pub authenticated: bool,
}

/// The `git` CLI with authentication applied.
#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    auth: GitAuth,
    ca_bundle_path: Option<PathBuf>,
    clone_root: PathBuf,
    askpass: Option<PathBuf>,
    poll_interval: Duration,
}

impl Git {
    /// # Errors
    ///
    /// Returns an I/O error if the askpass helper cannot be written.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        auth: GitAuth,
        ca_bundle_path: Option<PathBuf>,
        clone_root: &Path,
    ) -> Result<Self> {
        let askpass = match &auth {
            GitAuth::SshKey {
                passphrase: Some(_), ..
            } => Some(write_askpass(clone_root)?),
            _ => None,
        };

        Ok(Self {
            runner,
            auth,
            ca_bundle_path,
            clone_root: clone_root.to_path_buf(),
            askpass,
            poll_interval: GIT_MERGE_POLL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Environment carrying identity, TLS trust and, when `authenticated`, credentials.
    fn envs(&self, authenticated: bool) -> Vec<(String, String)> {
        let mut config = vec![
            ("user.name".to_string(), GIT_AUTHOR_NAME.to_string()),
            ("user.email".to_string(), GIT_AUTHOR_EMAIL.to_string()),
        ];
        let mut envs = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];

        if let Some(ca) = &self.ca_bundle_path {
            envs.push(("GIT_SSL_CAINFO".into(), ca.display().to_string()));
        }

        if authenticated {
            match &self.auth {
                GitAuth::SshKey {
                    private_key_path,
                    username,
                    passphrase,
                } => {
                    envs.push((
                        "GIT_SSH_COMMAND".into(),
                        format!(
                            "ssh -i {} -l {username} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                            private_key_path.display()
                        ),
                    ));
                    if let (Some(passphrase), Some(askpass)) = (passphrase, &self.askpass) {
                        envs.push(("SSH_ASKPASS".into(), askpass.display().to_string()));
                        envs.push(("SSH_ASKPASS_REQUIRE".into(), "force".into()));
                        envs.push((ENV_PASSPHRASE.into(), passphrase.clone()));
                    }
                }
                GitAuth::Basic { username, password } => {
                    let token = BASE64.encode(format!("{username}:{password}"));
                    config.push((
                        "http.extraHeader".to_string(),
                        format!("Authorization: Basic {token}"),
                    ));
                }
                GitAuth::SshAgent => {
                    envs.push((
                        "GIT_SSH_COMMAND".into(),
                        "ssh -o StrictHostKeyChecking=accept-new".into(),
                    ));
                }
            }
        }

        envs.push(("GIT_CONFIG_COUNT".into(), config.len().to_string()));
        for (index, (key, value)) in config.into_iter().enumerate() {
            envs.push((format!("GIT_CONFIG_KEY_{index}"), key));
            envs.push((format!("GIT_CONFIG_VALUE_{index}"), value));
        }
        envs
    }

    fn invocation(&self, dir: Option<&Path>, authenticated: bool, args: &[&str]) -> Invocation {
        let mut invocation = Invocation::new("git");
        if let Some(dir) = dir {
            invocation = invocation.args(["-C".to_string(), dir.display().to_string()]);
        }
        let mut invocation = invocation.args(args.iter().copied());
        for (key, value) in self.envs(authenticated) {
            invocation = invocation.env(key, value);
        }
        invocation
    }

    async fn git(&self, repo: &Repo, args: &[&str]) -> Result<String> {
        let invocation = self.invocation(Some(&repo.dir), repo.authenticated, args);
        Ok(run_checked(self.runner.as_ref(), invocation).await?)
    }

    /// Clone `url`, or reuse an existing clone reset to the default branch.
    ///
    /// With `tag`, a shallow clone of that tag is made instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the server rejects the credentials.
    pub async fn clone_or_open(
        &self,
        url: &str,
        tag: Option<&str>,
        authenticated: bool,
    ) -> Result<Repo> {
        let location = RepoLocation::parse(url)?;
        let dir = location.clone_dir(&self.clone_root);

        let mut repo = Repo {
            url: url.to_string(),
            dir: dir.clone(),
            default_branch: String::new(),
            authenticated,
        };

        if dir.join(".git").is_dir() {
            info!(repo = %url, path = %dir.display(), "Reusing existing clone");
            repo.default_branch = self.default_branch(&repo).await?;
            match tag {
                Some(tag) => self.checkout_tag(&repo, tag).await?,
                None => self.checkout_default(&repo).await?,
            }
            return Ok(repo);
        }

        info!(repo = %url, path = %dir.display(), "Cloning repo");
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir_arg = dir.display().to_string();
        let mut args = vec!["clone"];
        if let Some(tag) = tag {
            args.extend(["--depth", "1", "--branch", tag]);
        }
        args.extend([url, dir_arg.as_str()]);

        let output = self
            .runner
            .run(self.invocation(None, authenticated, &args))
            .await?;
        if !output.success() {
            return Err(classify_git_failure(url, &output.stderr));
        }

        if output.stderr.contains("cloned an empty repository") {
            self.initialize_empty(&mut repo).await?;
            return Ok(repo);
        }

        repo.default_branch = self.default_branch(&repo).await?;
        Ok(repo)
    }

    /// Push an initial empty commit to an empty remote.
    async fn initialize_empty(&self, repo: &mut Repo) -> Result<()> {
        info!(repo = %repo.url, "Remote repository is empty, initializing it");
        repo.default_branch = "main".to_string();
        self.git(repo, &["checkout", "-b", "main"]).await?;
        self.git(repo, &["commit", "--allow-empty", "-m", "chore : init"])
            .await?;
        self.git(repo, &["push", "origin", "refs/heads/main:refs/heads/main"])
            .await?;
        Ok(())
    }

    /// Name of the remote's default branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote HEAD cannot be resolved.
    pub async fn default_branch(&self, repo: &Repo) -> Result<String> {
        let output = self
            .git(repo, &["ls-remote", "--symref", "origin", "HEAD"])
            .await?;
        let branch = parse_symref(&output).ok_or_else(|| {
            Error::precondition(format!("failed detecting default branch of {}", repo.url))
        })?;
        debug!(repo = %repo.url, branch = %branch, "Detected default branch");
        Ok(branch)
    }

    /// Discard local changes, check out the default branch and fast-forward it to the remote.
    ///
    /// # Errors
    ///
    /// Returns an error if a git command fails.
    pub async fn checkout_default(&self, repo: &Repo) -> Result<()> {
        let branch = repo.default_branch.as_str();
        let upstream = format!("origin/{branch}");

        self.git(repo, &["reset", "--hard"]).await?;
        self.git(repo, &["clean", "-fd"]).await?;
        self.git(repo, &["fetch", "origin", "--prune", "--tags"]).await?;
        self.git(repo, &["checkout", "-B", branch, upstream.as_str()])
            .await?;
        self.git(repo, &["reset", "--hard", upstream.as_str()]).await?;
        info!(repo = %repo.url, branch = %branch, "Checked out default branch");
        Ok(())
    }

    /// Force-checkout a tag, fetching it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag does not exist upstream.
    pub async fn checkout_tag(&self, repo: &Repo, tag: &str) -> Result<()> {
        let tag_ref = format!("refs/tags/{tag}:refs/tags/{tag}");
        self.git(repo, &["fetch", "--depth", "1", "--force", "origin", tag_ref.as_str()])
            .await?;
        let target = format!("tags/{tag}");
        self.git(repo, &["checkout", "--force", target.as_str()])
            .await?;
        info!(repo = %repo.url, tag = %tag, "Checked out tag");
        Ok(())
    }

    /// Reset to the default branch, then create and check out `branch`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatePrecondition`] when the branch already exists.
    pub async fn create_branch(&self, repo: &Repo, branch: &str) -> Result<()> {
        self.checkout_default(repo).await?;

        let local = format!("refs/heads/{branch}");
        let remote = format!("refs/remotes/origin/{branch}");
        for reference in [&local, &remote] {
            let output = self
                .runner
                .run(self.invocation(
                    Some(&repo.dir),
                    repo.authenticated,
                    &["rev-parse", "--verify", "--quiet", reference.as_str()],
                ))
                .await?;
            if output.success() {
                return Err(Error::precondition(format!(
                    "branch {branch} already exists in {}",
                    repo.url
                )));
            }
        }

        self.git(repo, &["checkout", "-b", branch]).await?;
        info!(branch = %branch, "Created and checked out new branch");
        Ok(())
    }

    /// Stage `pathspec`, commit and push `branch`. Returns the commit hash.
    ///
    /// # Errors
    ///
    /// Returns an error if any git command fails.
    pub async fn commit_and_push(
        &self,
        repo: &Repo,
        branch: &str,
        pathspec: &str,
        message: &str,
    ) -> Result<String> {
        self.git(repo, &["add", "-A", "--", pathspec]).await?;
        let status = self.git(repo, &["status", "--porcelain"]).await?;
        info!(status = %status.trim(), "Determined git status");

        self.git(repo, &["commit", "--allow-empty", "-m", message])
            .await?;
        let commit = self.git(repo, &["rev-parse", "HEAD"]).await?.trim().to_string();

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.git(repo, &["push", "origin", refspec.as_str()]).await?;
        info!(branch = %branch, commit = %commit, "Added, committed and pushed changes");

        if branch != repo.default_branch {
            let location = RepoLocation::parse(&repo.url)?;
            ui::print_pull_request_hint(&location.compare_url(&repo.default_branch, branch), branch);
        }
        Ok(commit)
    }

    /// Block until `commit` is reachable from the remote default branch.
    ///
    /// # Errors
    ///
    /// Returns an error if git reports anything but "not yet merged".
    pub async fn wait_for_merge(&self, repo: &Repo, branch: &str, commit: &str) -> Result<()> {
        let upstream = format!("origin/{}", repo.default_branch);
        loop {
            info!(
                from_branch = %branch,
                to_branch = %repo.default_branch,
                "Waiting for PR to be merged. Sleeping for {} seconds....",
                self.poll_interval.as_secs()
            );
            tokio::time::sleep(self.poll_interval).await;

            if let Err(e) = self.git(repo, &["fetch", "origin", "--prune"]).await {
                warn!(error = %e, "Failed fetching, retrying");
                continue;
            }

            let output = self
                .runner
                .run(self.invocation(
                    Some(&repo.dir),
                    repo.authenticated,
                    &["merge-base", "--is-ancestor", commit, upstream.as_str()],
                ))
                .await?;
            match output.status {
                0 => {
                    info!(branch = %branch, "Detected branch merged");
                    return Ok(());
                }
                1 => {}
                _ => {
                    return Err(CloudProviderError::Command {
                        program: "git merge-base".into(),
                        stderr: output.stderr.trim().to_string(),
                    }
                    .into())
                }
            }
        }
    }
}

fn write_askpass(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(ASKPASS_SCRIPT);
    let mut script = String::from("#!/bin/sh\n");
    let _ = writeln!(script, "printf '%s\\n' \"${ENV_PASSPHRASE}\"");
    std::fs::write(&path, script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}

/// Branch named by `ref: refs/heads/<branch>\tHEAD` in `git ls-remote --symref` output.
fn parse_symref(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.strip_prefix("ref: refs/heads/")?;
        let (branch, head) = rest.split_once('\t')?;
        (head.trim() == "HEAD").then(|| branch.to_string())
    })
}

fn classify_git_failure(url: &str, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    if lowered.contains("authentication failed")
        || lowered.contains("permission denied")
        || lowered.contains("could not read username")
        || lowered.contains("403")
    {
        return Error::Auth(format!("git server rejected credentials for {url}: {}", stderr.trim()));
    }
    CloudProviderError::Command {
        program: "git clone".into(),
        stderr: stderr.trim().to_string(),
    }
    .into()
}

/// Whether `url` can be cloned anonymously: an HTTP(S) URL that answers 200.
///
/// # Errors
///
/// Returns an error if the CA bundle is invalid or the request cannot be sent.
pub async fn is_public(url: &str, ca_bundle: Option<&str>) -> Result<bool> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Ok(false);
    }

    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
    if let Some(pem) = ca_bundle {
        for certificate in reqwest::Certificate::from_pem_bundle(pem.as_bytes())? {
            builder = builder.add_root_certificate(certificate);
        }
    }
    let response = builder.build()?.get(url).send().await?;
    Ok(response.status() == reqwest::StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn output(status: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            status,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn repo() -> Repo {
        Repo {
            url: "https://gitea.example.com/acme/kubeaid-config.git".into(),
            dir: PathBuf::from("/tmp/kubeaid-core/gitea.example.com/acme/kubeaid-config"),
            default_branch: "main".into(),
            authenticated: true,
        }
    }

    fn env<'a>(invocation: &'a Invocation, key: &str) -> Option<&'a str> {
        invocation
            .envs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_repo_locations() {
        let https = RepoLocation::parse("https://github.com/Obmondo/KubeAid").unwrap();
        assert_eq!(https.host, "github.com");
        assert_eq!(https.owner, "Obmondo");
        assert_eq!(https.name, "KubeAid");

        let scp = RepoLocation::parse("git@gitlab.example.com:infra/k8s/kubeaid-config.git").unwrap();
        assert_eq!(scp.host, "gitlab.example.com");
        assert_eq!(scp.owner, "infra/k8s");
        assert_eq!(scp.name, "kubeaid-config");

        let ssh = RepoLocation::parse("ssh://git@git.example.com:2222/acme/config.git").unwrap();
        assert_eq!(ssh.host, "git.example.com");
        assert_eq!(
            ssh.clone_dir(Path::new("/tmp/kubeaid-core")),
            PathBuf::from("/tmp/kubeaid-core/git.example.com/acme/config")
        );

        assert!(RepoLocation::parse("https://github.com/").is_err());
        assert!(RepoLocation::parse("not a url").is_err());
    }

    #[test]
    fn test_compare_url() {
        let location = RepoLocation::parse("https://github.com/acme/kubeaid-config.git").unwrap();
        assert_eq!(
            location.compare_url("main", "kubeaid-demo-1700000000"),
            "https://github.com/acme/kubeaid-config/compare/main...acme:kubeaid-config:kubeaid-demo-1700000000"
        );
    }

    #[test]
    fn test_parse_symref() {
        let output = "ref: refs/heads/master\tHEAD\n3f0c1a\tHEAD\n";
        assert_eq!(parse_symref(output).as_deref(), Some("master"));
        assert_eq!(parse_symref("3f0c1a\tHEAD\n"), None);
    }

    #[test]
    fn test_basic_auth_goes_through_git_config_env() {
        let git = Git::new(
            Arc::new(MockCommandRunner::new()),
            GitAuth::Basic {
                username: "bot".into(),
                password: "s3cret".into(),
            },
            Some(PathBuf::from("/etc/ca.pem")),
            Path::new("/tmp/kubeaid-core"),
        )
        .unwrap();

        let invocation = git.invocation(None, true, &["fetch"]);
        assert_eq!(env(&invocation, "GIT_CONFIG_COUNT"), Some("3"));
        assert_eq!(env(&invocation, "GIT_CONFIG_KEY_2"), Some("http.extraHeader"));
        assert_eq!(
            env(&invocation, "GIT_CONFIG_VALUE_2"),
            Some("Authorization: Basic Ym90OnMzY3JldA==")
        );
        assert_eq!(env(&invocation, "GIT_SSL_CAINFO"), Some("/etc/ca.pem"));
        assert!(!invocation.args.iter().any(|a| a.contains("s3cret")));

        let anonymous = git.invocation(None, false, &["clone"]);
        assert_eq!(env(&anonymous, "GIT_CONFIG_COUNT"), Some("2"));
    }

    #[test]
    fn test_ssh_key_with_passphrase_uses_askpass() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(
            Arc::new(MockCommandRunner::new()),
            GitAuth::SshKey {
                private_key_path: PathBuf::from("/home/me/.ssh/id_ed25519"),
                username: "git".into(),
                passphrase: Some("hunter2".into()),
            },
            None,
            dir.path(),
        )
        .unwrap();

        let invocation = git.invocation(None, true, &["fetch"]);
        assert!(env(&invocation, "GIT_SSH_COMMAND")
            .unwrap()
            .contains("-i /home/me/.ssh/id_ed25519"));
        assert_eq!(env(&invocation, ENV_PASSPHRASE), Some("hunter2"));
        let askpass = std::fs::read_to_string(dir.path().join(ASKPASS_SCRIPT)).unwrap();
        assert!(askpass.contains(ENV_PASSPHRASE));
    }

    #[tokio::test]
    async fn test_create_branch_refuses_existing() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|invocation| {
            let verify = invocation.args.iter().any(|a| a == "rev-parse");
            let remote = invocation
                .args
                .iter()
                .any(|a| a == "refs/remotes/origin/kubeaid-demo-1");
            Ok(if verify && !remote {
                output(1, "")
            } else {
                output(0, "")
            })
        });

        let git = Git::new(
            Arc::new(runner),
            GitAuth::SshAgent,
            None,
            Path::new("/tmp/kubeaid-core"),
        )
        .unwrap();
        let err = git.create_branch(&repo(), "kubeaid-demo-1").await.unwrap_err();
        assert!(matches!(err, Error::StatePrecondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_merge_polls_until_ancestor() {
        let mut runner = MockCommandRunner::new();
        let mut checks = 0;
        runner.expect_run().returning(move |invocation| {
            if invocation.args.iter().any(|a| a == "merge-base") {
                checks += 1;
                assert!(invocation.args.contains(&"origin/main".to_string()));
                return Ok(output(if checks < 3 { 1 } else { 0 }, ""));
            }
            Ok(output(0, ""))
        });

        let git = Git::new(
            Arc::new(runner),
            GitAuth::SshAgent,
            None,
            Path::new("/tmp/kubeaid-core"),
        )
        .unwrap();
        git.wait_for_merge(&repo(), "kubeaid-demo-1", "abc123")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clone_rejected_credentials_is_auth_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: 128,
                stdout: String::new(),
                stderr: "fatal: Authentication failed for 'https://gitea.example.com/acme/config.git/'".into(),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(Arc::new(runner), GitAuth::SshAgent, None, dir.path()).unwrap();
        let err = git
            .clone_or_open("https://gitea.example.com/acme/config.git", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_is_public() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(is_public(&server.uri(), None).await.unwrap());
        assert!(!is_public("git@github.com:acme/config.git", None).await.unwrap());
    }
}
