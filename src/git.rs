use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::credentials::Authenticator;
use crate::error::{classify_git_error, SyncError, SyncStep};

/// Name of the remote every working copy tracks
pub const REMOTE: &str = "origin";

/// Thin async wrapper around the `git` command line
#[derive(Debug, Clone)]
pub struct GitClient {
    program: String,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitClient {
    /// Create a client that runs `git` from PATH
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Whether `path` holds version-control metadata
    pub fn is_repository(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Clone `url` into `target`, fetching all tags
    pub async fn clone_repository(
        &self,
        url: &str,
        target: &Path,
        auth: Option<&Authenticator>,
    ) -> Result<(), SyncError> {
        let target = target.to_string_lossy();
        self.run_checked(SyncStep::Clone, None, &["clone", "--", url, &target], auth)
            .await?;
        Ok(())
    }

    /// Short name of the checked-out branch, `None` when HEAD is detached
    pub async fn current_branch(&self, path: &Path) -> Result<Option<String>, SyncError> {
        let output = self
            .run(Some(path), &["symbolic-ref", "--quiet", "--short", "HEAD"], None)
            .await?;

        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Commit hash a reference points at, `None` when it does not resolve
    pub async fn resolve_commit(
        &self,
        path: &Path,
        reference: &str,
    ) -> Result<Option<String>, SyncError> {
        let spec = format!("{}^{{commit}}", reference);
        let output = self
            .run(Some(path), &["rev-parse", "--verify", "--quiet", &spec], None)
            .await?;

        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// URL of the tracked remote, if one is configured
    pub async fn remote_url(&self, path: &Path) -> Result<Option<String>, SyncError> {
        let output = self
            .run(Some(path), &["remote", "get-url", REMOTE], None)
            .await?;

        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Point the tracked remote at `url`, adding it if missing
    pub async fn ensure_remote(&self, path: &Path, url: &str) -> Result<(), SyncError> {
        match self.remote_url(path).await? {
            Some(actual) if remote_urls_match(&actual, url) => return Ok(()),
            Some(actual) => {
                warn!(
                    "Remote of {} is {}, re-pointing to configured {}",
                    path.display(),
                    actual,
                    url
                );
                self.run_checked(SyncStep::Open, Some(path), &["remote", "set-url", REMOTE, url], None)
                    .await?;
            }
            None => {
                warn!("{} has no '{}' remote, adding {}", path.display(), REMOTE, url);
                self.run_checked(SyncStep::Open, Some(path), &["remote", "add", REMOTE, url], None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Force-fetch every branch and tag of the tracked remote
    pub async fn fetch_all(&self, path: &Path, auth: Option<&Authenticator>) -> Result<(), SyncError> {
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", REMOTE);
        self.run_checked(
            SyncStep::Fetch,
            Some(path),
            &["fetch", "--force", "--tags", REMOTE, &refspec],
            auth,
        )
        .await?;
        Ok(())
    }

    /// Create or move `branch` to `commit`, check it out and track the remote branch
    pub async fn checkout_branch_at(
        &self,
        path: &Path,
        branch: &str,
        commit: &str,
    ) -> Result<(), SyncError> {
        self.run_checked(
            SyncStep::Checkout,
            Some(path),
            &["checkout", "--force", "-B", branch, commit],
            None,
        )
        .await?;

        let upstream = format!("{}/{}", REMOTE, branch);
        if let Err(e) = self
            .run_checked(
                SyncStep::Checkout,
                Some(path),
                &["branch", "--set-upstream-to", &upstream, branch],
                None,
            )
            .await
        {
            warn!("Could not set upstream of {} to {}: {}", branch, upstream, e);
        }

        Ok(())
    }

    /// Move HEAD, index and working tree to `commit`
    pub async fn reset_hard(&self, path: &Path, commit: &str) -> Result<(), SyncError> {
        self.run_checked(SyncStep::Reset, Some(path), &["reset", "--hard", commit], None)
            .await?;
        Ok(())
    }

    /// Delete untracked files and directories that are not ignored
    pub async fn clean_untracked(&self, path: &Path) -> Result<(), SyncError> {
        self.run_checked(SyncStep::Clean, Some(path), &["clean", "-f", "-d"], None)
            .await?;
        Ok(())
    }

    // Helper methods for running git

    async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        auth: Option<&Authenticator>,
    ) -> Result<Output, SyncError> {
        let mut command = AsyncCommand::new(&self.program);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        if let Some(auth) = auth {
            command.envs(auth.env());
        }

        debug!("git {}", args.join(" "));

        command
            .output()
            .await
            .map_err(|e| SyncError::io(format!("Failed to execute git {}", args[0]), e))
    }

    async fn run_checked(
        &self,
        step: SyncStep,
        dir: Option<&Path>,
        args: &[&str],
        auth: Option<&Authenticator>,
    ) -> Result<String, SyncError> {
        let output = self.run(dir, args, auth).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_error(step, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Compare remote URLs, ignoring a trailing slash or `.git` suffix
pub fn remote_urls_match(actual: &str, expected: &str) -> bool {
    let normalize = |url: &str| -> String {
        url.trim()
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .to_string()
    };

    normalize(actual) == normalize(expected)
}
