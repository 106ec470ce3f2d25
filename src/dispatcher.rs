//! Trigger Dispatcher - maps push events to sync invocations
//!
//! A push is accepted only for a registered repository and only when the
//! pushed ref is the repository's configured branch. Accepted pushes are
//! spawned onto the runtime and the caller gets a [`SyncTicket`] back
//! immediately; it may wait on the ticket or drop it.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::registry::{Registry, RepositoryConfig};
use crate::sync::{SyncEngine, SyncReport, SyncSummary};

/// Why a push was not acted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotRegistered,
    WrongBranch { expected: String, pushed: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotRegistered => write!(f, "repository is not registered"),
            RejectReason::WrongBranch { expected, pushed } => {
                write!(f, "pushed {} but tracking {}", pushed, expected)
            }
        }
    }
}

/// Handle on a dispatched sync invocation
#[derive(Debug)]
pub struct SyncTicket {
    repository: String,
    handle: JoinHandle<SyncReport>,
}

impl SyncTicket {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Wait for the invocation to finish. `None` if the task was cancelled.
    pub async fn wait(self) -> Option<SyncReport> {
        match self.handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Sync task for {} did not complete: {}", self.repository, e);
                None
            }
        }
    }
}

#[derive(Debug)]
pub enum TriggerResponse {
    Accepted(SyncTicket),
    Rejected(RejectReason),
}

impl TriggerResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerResponse::Accepted(_))
    }
}

/// Routes triggers to the engine, bounding concurrent invocations.
///
/// The bound counts invocations doing work; a trigger waiting for another
/// run of the same working copy does not use it up.
#[derive(Clone)]
pub struct TriggerDispatcher {
    registry: Arc<Registry>,
    engine: Arc<SyncEngine>,
    permits: Arc<Semaphore>,
}

impl TriggerDispatcher {
    pub fn new(registry: Arc<Registry>, engine: Arc<SyncEngine>, max_parallel: usize) -> Self {
        Self {
            registry,
            engine,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn from_config(config: &Config, registry: Registry) -> Self {
        Self::new(
            Arc::new(registry),
            Arc::new(SyncEngine::from_config(config)),
            config.sync.max_parallel,
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle a push of `pushed_ref` to `repository`. Returns without waiting for the sync.
    pub fn on_push_event(&self, repository: &str, pushed_ref: &str) -> TriggerResponse {
        let Some(repo) = self.registry.get(repository) else {
            warn!("Push for unregistered repository '{}' ignored", repository);
            return TriggerResponse::Rejected(RejectReason::NotRegistered);
        };

        let expected = repo.expected_ref();
        if expected != pushed_ref {
            debug!(
                "Push to {} of {} ignored, tracking {}",
                repository, pushed_ref, expected
            );
            return TriggerResponse::Rejected(RejectReason::WrongBranch {
                expected,
                pushed: pushed_ref.to_string(),
            });
        }

        info!("Push to {} accepted, dispatching sync", repository);
        TriggerResponse::Accepted(self.dispatch(repo.clone()))
    }

    /// Spawn a sync for `repo` without branch checks
    pub fn dispatch(&self, repo: RepositoryConfig) -> SyncTicket {
        let repository = repo.name.clone();
        let engine = self.engine.clone();
        let permits = self.permits.clone();

        let handle =
            tokio::spawn(async move { engine.sync_bounded(&repo, Some(&*permits)).await });

        SyncTicket { repository, handle }
    }

    /// Sync every registered repository and wait for all of them
    pub async fn sync_all(&self) -> SyncSummary {
        let repos: Vec<_> = self.registry.iter().cloned().collect();
        self.sync_batch(repos).await
    }

    /// Sync the named repositories and wait. Unknown names are returned as errors.
    pub async fn sync_named(&self, names: &[String]) -> Result<SyncSummary, Vec<String>> {
        let unknown: Vec<String> = names
            .iter()
            .filter(|name| self.registry.get(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(unknown);
        }

        let repos = names
            .iter()
            .filter_map(|name| self.registry.get(name))
            .cloned()
            .collect();
        Ok(self.sync_batch(repos).await)
    }

    async fn sync_batch(&self, repos: Vec<RepositoryConfig>) -> SyncSummary {
        let start = Instant::now();
        info!("Syncing {} repositories", repos.len());

        let mut tickets: FuturesUnordered<_> =
            repos.into_iter().map(|repo| self.dispatch(repo).wait()).collect();

        let mut reports = Vec::new();
        while let Some(report) = tickets.next().await {
            if let Some(report) = report {
                reports.push(report);
            }
        }

        let summary = SyncSummary::from_reports(reports, start.elapsed());
        info!(
            "Sync completed in {:.2}s: {} successful, {} failed",
            summary.duration.as_secs_f64(),
            summary.successful_operations,
            summary.failed_operations
        );
        summary
    }
}
