//! Sync Engine - brings one working copy up to date with its remote branch
//!
//! Every invocation runs the same pipeline:
//!
//! 1. Hand the repository to its delegate script, if one is configured. A
//!    successful script ends the invocation; a failed or missing one falls
//!    through to the built-in synchronization.
//! 2. Without version-control metadata at the working-copy path the remote
//!    is cloned and the configured branch checked out.
//! 3. Otherwise `origin` is force-fetched and `HEAD` compared with the
//!    remote-tracking ref of the configured branch. On a mismatch, or when
//!    `HEAD` is not on the configured branch, the
//!    working copy is forced to the remote tip (hard reset, then removal of
//!    untracked files); local drift never survives.
//!
//! Invocations for the same working-copy path are serialized, and each one
//! is bounded by the configured timeout. Errors never escape: they are
//! logged and reported as [`SyncOutcome::Failed`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{timeout_at, Instant as Deadline};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::credentials::{Authenticator, CredentialResolver};
use crate::error::SyncError;
use crate::git::{GitClient, REMOTE};
use crate::registry::RepositoryConfig;
use crate::script::{ScriptDelegate, ScriptResult};

/// Terminal state of one invocation
#[derive(Debug)]
pub enum SyncOutcome {
    /// `HEAD` already pointed at the remote tip; nothing was written
    AlreadyUpToDate { head: String },
    /// The working copy was forced from `from` (if `HEAD` resolved) to `to`
    Updated { from: Option<String>, to: String },
    /// The working copy was missing and has been cloned at `head`
    ClonedFresh { head: String },
    /// The delegate script succeeded; built-in synchronization was skipped
    DelegatedToScript,
    Failed(SyncError),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed(_))
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::AlreadyUpToDate { head } => write!(f, "already up to date at {}", short(head)),
            SyncOutcome::Updated { from: Some(from), to } => {
                write!(f, "updated {} -> {}", short(from), short(to))
            }
            SyncOutcome::Updated { from: None, to } => write!(f, "updated to {}", short(to)),
            SyncOutcome::ClonedFresh { head } => write!(f, "cloned at {}", short(head)),
            SyncOutcome::DelegatedToScript => write!(f, "handled by script"),
            SyncOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Everything one invocation produced, for logging and summaries
#[derive(Debug)]
pub struct SyncReport {
    pub repository: String,
    pub script: ScriptResult,
    pub outcome: SyncOutcome,
    pub duration: Duration,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Results from a batch of invocations
#[derive(Debug)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub duration: Duration,
    pub reports: Vec<SyncReport>,
}

impl SyncSummary {
    pub fn from_reports(reports: Vec<SyncReport>, duration: Duration) -> Self {
        let failed_operations = reports.iter().filter(|r| !r.is_success()).count();

        Self {
            total_repositories: reports.len(),
            successful_operations: reports.len() - failed_operations,
            failed_operations,
            duration,
            reports,
        }
    }
}

/// Engine behaviour switches taken from `sync` configuration
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub timeout: Duration,
    pub clean_untracked: bool,
    pub cleanup_on_error: bool,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.sync_timeout(),
            clean_untracked: config.sync.clean_untracked,
            cleanup_on_error: config.sync.cleanup_on_error,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The synchronization engine. Shared behind an `Arc` by every trigger.
pub struct SyncEngine {
    git: GitClient,
    credentials: CredentialResolver,
    scripts: ScriptDelegate,
    settings: SyncSettings,
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        git: GitClient,
        credentials: CredentialResolver,
        scripts: ScriptDelegate,
        settings: SyncSettings,
    ) -> Self {
        Self {
            git,
            credentials,
            scripts,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build an engine from service configuration
    pub fn from_config(config: &Config) -> Self {
        let credentials = CredentialResolver::from_config(config);
        let scripts = ScriptDelegate::from_config(config, credentials.clone());

        Self::new(
            GitClient::new(),
            credentials,
            scripts,
            SyncSettings::from_config(config),
        )
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one invocation for `repo`. Never fails; errors end up in the report.
    pub async fn sync(&self, repo: &RepositoryConfig) -> SyncReport {
        self.sync_bounded(repo, None).await
    }

    /// Like [`sync`](Self::sync), but takes a permit from `permits` once the
    /// working copy lock is held. Invocations queued behind another run of
    /// the same working copy hold no permit while they wait.
    pub async fn sync_bounded(
        &self,
        repo: &RepositoryConfig,
        permits: Option<&Semaphore>,
    ) -> SyncReport {
        let span = info_span!("sync", repository = %repo.name);
        self.sync_serialized(repo, permits).instrument(span).await
    }

    async fn sync_serialized(
        &self,
        repo: &RepositoryConfig,
        permits: Option<&Semaphore>,
    ) -> SyncReport {
        let lock = self.lock_for(&repo.local_path);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Waiting for running sync of {}", repo.local_path.display());
                lock.lock().await
            }
        };

        // A closed semaphore leaves the run unbounded
        let _permit = match permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };

        let start = Instant::now();
        let deadline = Deadline::now() + self.settings.timeout;
        let timeout_secs = self.settings.timeout.as_secs();

        let script = match timeout_at(deadline, self.scripts.try_delegate(repo)).await {
            Ok(script) => script,
            Err(_) => {
                let outcome = SyncOutcome::Failed(SyncError::Timeout(timeout_secs));
                return self.finish(repo, ScriptResult::timed_out(), outcome, start);
            }
        };

        let outcome = if script.handled() {
            SyncOutcome::DelegatedToScript
        } else {
            if let ScriptResult::Failure { status, .. } = &script {
                warn!(
                    "Script for {} failed (status {:?}), falling back to built-in sync",
                    repo.name, status
                );
            }

            match timeout_at(deadline, self.converge(repo)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => SyncOutcome::Failed(e),
                Err(_) => SyncOutcome::Failed(SyncError::Timeout(timeout_secs)),
            }
        };

        self.finish(repo, script, outcome, start)
    }

    fn finish(
        &self,
        repo: &RepositoryConfig,
        script: ScriptResult,
        outcome: SyncOutcome,
        start: Instant,
    ) -> SyncReport {
        let duration = start.elapsed();

        match &outcome {
            SyncOutcome::Failed(e) => {
                let step = e.step().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                error!(
                    repository = %repo.name,
                    step = %step,
                    "Sync of {} failed: {}",
                    repo.name,
                    e
                );
            }
            outcome => info!(
                "Sync of {} finished in {:.2}s: {}",
                repo.name,
                duration.as_secs_f64(),
                outcome
            ),
        }

        SyncReport {
            repository: repo.name.clone(),
            script,
            outcome,
            duration,
        }
    }

    /// Lock guarding the working copy at `path`, created on first use
    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    async fn converge(&self, repo: &RepositoryConfig) -> Result<SyncOutcome, SyncError> {
        let auth = self.credentials.resolve_for(repo)?;

        if GitClient::is_repository(&repo.local_path) {
            self.update(repo, auth.as_ref()).await
        } else {
            self.clone_fresh(repo, auth.as_ref()).await
        }
    }

    async fn clone_fresh(
        &self,
        repo: &RepositoryConfig,
        auth: Option<&Authenticator>,
    ) -> Result<SyncOutcome, SyncError> {
        let path = &repo.local_path;
        prepare_clone_target(path).await?;

        info!("Cloning {} into {}", repo.remote_url, path.display());
        let result = self.clone_and_checkout(repo, auth).await;

        if result.is_err() && self.settings.cleanup_on_error && path.exists() {
            warn!("Removing partial clone at {}", path.display());
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                warn!("Failed to remove partial clone {}: {}", path.display(), e);
            }
        }

        result
    }

    async fn clone_and_checkout(
        &self,
        repo: &RepositoryConfig,
        auth: Option<&Authenticator>,
    ) -> Result<SyncOutcome, SyncError> {
        let path = &repo.local_path;
        self.git.clone_repository(&repo.remote_url, path, auth).await?;

        let target = self.remote_tip(repo).await?;

        // The clone checks out the remote's default branch
        let current = self.git.current_branch(path).await?;
        if current.as_deref() != Some(repo.branch.as_str()) {
            debug!(
                "Checking out {} at {} (clone is on {:?})",
                repo.branch,
                short(&target),
                current
            );
            self.git.checkout_branch_at(path, &repo.branch, &target).await?;
        }

        Ok(SyncOutcome::ClonedFresh { head: target })
    }

    async fn update(
        &self,
        repo: &RepositoryConfig,
        auth: Option<&Authenticator>,
    ) -> Result<SyncOutcome, SyncError> {
        let path = &repo.local_path;

        self.git.ensure_remote(path, &repo.remote_url).await?;
        debug!("Fetching {} into {}", repo.remote_url, path.display());
        self.git.fetch_all(path, auth).await?;

        let target = self.remote_tip(repo).await?;
        let head = self.git.resolve_commit(path, "HEAD").await?;
        let on_branch =
            self.git.current_branch(path).await?.as_deref() == Some(repo.branch.as_str());

        // A detached HEAD or another branch at the same commit still needs a checkout
        if on_branch && head.as_deref() == Some(target.as_str()) {
            debug!("{} already at {}", repo.name, short(&target));
            return Ok(SyncOutcome::AlreadyUpToDate { head: target });
        }

        if on_branch {
            self.git.reset_hard(path, &target).await?;
        } else {
            info!("{} is not on {}, switching branches", path.display(), repo.branch);
            self.git.checkout_branch_at(path, &repo.branch, &target).await?;
        }

        if self.settings.clean_untracked {
            self.git.clean_untracked(path).await?;
        }

        Ok(SyncOutcome::Updated {
            from: head,
            to: target,
        })
    }

    /// Commit of the remote-tracking ref for the configured branch
    async fn remote_tip(&self, repo: &RepositoryConfig) -> Result<String, SyncError> {
        let reference = format!("refs/remotes/{}/{}", REMOTE, repo.branch);

        self.git
            .resolve_commit(&repo.local_path, &reference)
            .await?
            .ok_or(SyncError::ReferenceNotFound { reference })
    }
}

/// Make `path` a valid clone destination.
///
/// Leftover content without version-control metadata is removed; the
/// parent directory is created.
async fn prepare_clone_target(path: &Path) -> Result<(), SyncError> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => {
            return Err(SyncError::io(
                format!("Refusing to use {} as a working copy", path.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ))
        }
    };

    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            let mut entries = tokio::fs::read_dir(path)
                .await
                .map_err(|e| SyncError::io(format!("Failed to read {}", path.display()), e))?;
            let empty = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::io(format!("Failed to read {}", path.display()), e))?
                .is_none();

            if !empty {
                warn!("Removing stale directory {} before clone", path.display());
                tokio::fs::remove_dir_all(path).await.map_err(|e| {
                    SyncError::io(format!("Failed to remove stale {}", path.display()), e)
                })?;
            }
        }
        Ok(_) => {
            warn!("Removing stale file {} before clone", path.display());
            tokio::fs::remove_file(path).await.map_err(|e| {
                SyncError::io(format!("Failed to remove stale {}", path.display()), e)
            })?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SyncError::io(format!("Failed to inspect {}", path.display()), e));
        }
    }

    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| SyncError::io(format!("Failed to create {}", parent.display()), e))
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
