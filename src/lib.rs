//! pushsync - keeps deployment working copies in sync with pushed branches
//!
//! A push notification names a repository and a ref. When the repository is
//! registered and the ref is its tracked branch, the working copy is brought
//! to the remote tip: cloned if missing, otherwise force-fetched and hard
//! reset. A repository may hand synchronization to its own script instead.
//!
//! ## Modules
//!
//! - [`config`]: Service configuration (YAML, XDG location)
//! - [`registry`]: Repository registry loading and defaulting
//! - [`credentials`]: Private key lookup and ssh authentication
//! - [`script`]: Delegate scripts
//! - [`git`]: git command-line wrapper
//! - [`sync`]: The synchronization engine
//! - [`dispatcher`]: Push event routing and concurrency bounds
//! - [`webhook`]: Signature verification and event decoding
//! - [`health`]: Preflight checks

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod health;
pub mod registry;
pub mod script;
pub mod sync;
pub mod webhook;

pub use config::Config;
pub use credentials::{Authenticator, CredentialResolver};
pub use dispatcher::{RejectReason, SyncTicket, TriggerDispatcher, TriggerResponse};
pub use error::{CredentialError, RegistryError, SyncError, WebhookError};
pub use git::GitClient;
pub use health::HealthCheck;
pub use registry::{Registry, RepositoryConfig, RepositoryEntry};
pub use script::{ScriptDelegate, ScriptResult};
pub use sync::{SyncEngine, SyncOutcome, SyncReport, SyncSettings, SyncSummary};
pub use webhook::{WebhookEvent, WebhookHandler, WebhookResponse};
