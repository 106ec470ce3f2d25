//! Error types for the synchronization engine and its collaborators.

use std::path::PathBuf;
use thiserror::Error;

/// Failures locating or reading a private key.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Private key '{key_ref}' not found (looked in: {})", display_paths(.searched))]
    KeyNotFound {
        key_ref: String,
        searched: Vec<PathBuf>,
    },

    #[error("Private key '{}' could not be parsed: {reason}", .path.display())]
    KeyUnparseable { path: PathBuf, reason: String },
}

/// Errors that terminate a single sync invocation.
///
/// None of these escape the engine: they end up inside
/// [`SyncOutcome::Failed`](crate::sync::SyncOutcome::Failed).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication setup failed: {0}")]
    Auth(#[from] CredentialError),

    #[error("Remote rejected credentials during {step}: {stderr}")]
    AuthRejected { step: SyncStep, stderr: String },

    #[error("Network failure during {step}: {stderr}")]
    Network { step: SyncStep, stderr: String },

    #[error("Reference '{reference}' not found")]
    ReferenceNotFound { reference: String },

    #[error("git {step} failed: {message}")]
    Git { step: SyncStep, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sync timed out after {0}s")]
    Timeout(u64),
}

impl SyncError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    /// The step this error was raised in, when it is known
    pub fn step(&self) -> Option<SyncStep> {
        match self {
            SyncError::Auth(_) => Some(SyncStep::Credentials),
            SyncError::AuthRejected { step, .. }
            | SyncError::Network { step, .. }
            | SyncError::Git { step, .. } => Some(*step),
            SyncError::ReferenceNotFound { .. } => Some(SyncStep::Compare),
            SyncError::Io { .. } | SyncError::Timeout(_) => None,
        }
    }
}

/// The step of an invocation an error was raised in. Used for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Credentials,
    Clone,
    Checkout,
    Open,
    Fetch,
    Compare,
    Reset,
    Clean,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStep::Credentials => "credentials",
            SyncStep::Clone => "clone",
            SyncStep::Checkout => "checkout",
            SyncStep::Open => "open",
            SyncStep::Fetch => "fetch",
            SyncStep::Compare => "compare",
            SyncStep::Reset => "reset",
            SyncStep::Clean => "clean",
        };
        f.write_str(name)
    }
}

/// Invalid or unreadable repository registry. Fatal at startup.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Repository file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to parse repository file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Repository '{0}' is declared more than once")]
    Duplicate(String),

    #[error("Repository '{name}' has no remote and no remote_url_template is configured")]
    MissingRemote { name: String },

    #[error("Failed to expand {field} for repository '{name}': {message}")]
    Expand {
        name: String,
        field: &'static str,
        message: String,
    },
}

/// Rejections produced while authenticating or decoding a webhook delivery.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Signature is not valid hex")]
    MalformedSignature,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Classifies git stderr into a more specific error variant.
pub fn classify_git_error(step: SyncStep, stderr: &str) -> SyncError {
    let lower = stderr.to_lowercase();
    let stderr = stderr.trim().to_string();

    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("host key verification failed")
        || lower.contains("could not read username")
    {
        return SyncError::AuthRejected { step, stderr };
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("the remote end hung up unexpectedly")
        || lower.contains("could not read from remote repository")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("repository not found")
        || (lower.contains("repository '") && lower.contains("does not exist"))
    {
        return SyncError::Network { step, stderr };
    }

    SyncError::Git {
        step,
        message: stderr,
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
