//! Script Delegate - hands a repository's synchronization to a user script
//!
//! A repository that declares `script` is synchronized by running
//! `bash <script>` with `BRANCH`, `WORK_PATH` and `REPOS` exported (each
//! shell-quoted so it is a single token), plus `GIT_SSH_COMMAND` when the
//! repository has a key. The engine only skips its own synchronization when
//! the script reports success; see [`ScriptResult`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::{self, CredentialResolver, GIT_SSH_COMMAND};
use crate::registry::RepositoryConfig;

/// Outcome of attempting to delegate a sync to a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResult {
    /// The repository declares no script
    NotConfigured,
    /// A script is declared but exists neither as a path nor in the script directory
    NotFound { script: String },
    /// The script exited with status zero
    Success { output: String },
    /// The script could not be started or exited non-zero
    Failure { status: Option<i32>, output: String },
}

impl ScriptResult {
    /// Whether internal synchronization must be skipped
    pub fn handled(&self) -> bool {
        matches!(self, ScriptResult::Success { .. })
    }

    pub(crate) fn timed_out() -> Self {
        ScriptResult::Failure {
            status: None,
            output: "script timed out".to_string(),
        }
    }
}

/// Runs per-repository override scripts
#[derive(Debug, Clone)]
pub struct ScriptDelegate {
    script_directory: PathBuf,
    credentials: CredentialResolver,
}

impl ScriptDelegate {
    pub fn new(script_directory: impl Into<PathBuf>, credentials: CredentialResolver) -> Self {
        Self {
            script_directory: script_directory.into(),
            credentials,
        }
    }

    pub fn from_config(config: &Config, credentials: CredentialResolver) -> Self {
        Self::new(&config.conventions.script_directory, credentials)
    }

    /// Resolve a script reference: a direct path, else a name in the script directory
    pub fn locate(&self, script: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(script);
        if direct.is_file() {
            return Some(direct);
        }

        let in_directory = self.script_directory.join(script);
        in_directory.is_file().then_some(in_directory)
    }

    /// Environment exported to the script
    pub fn environment(&self, repo: &RepositoryConfig) -> Vec<(String, String)> {
        let mut env = vec![
            ("BRANCH".to_string(), shell_quote(&repo.branch)),
            (
                "WORK_PATH".to_string(),
                shell_quote(&repo.local_path.display().to_string()),
            ),
            ("REPOS".to_string(), shell_quote(&repo.name)),
        ];

        if let Some(key) = &repo.auth_key {
            let key_path = self.credentials.expected_path(key);
            env.push((
                GIT_SSH_COMMAND.to_string(),
                credentials::ssh_command(&key_path, self.credentials.verify_host_identity()),
            ));
        }

        env
    }

    /// Run the repository's script if it has one
    pub async fn try_delegate(&self, repo: &RepositoryConfig) -> ScriptResult {
        let Some(script) = repo.script.as_deref() else {
            return ScriptResult::NotConfigured;
        };

        let Some(path) = self.locate(script) else {
            warn!(
                "Script '{}' for {} not found (also looked in {})",
                script,
                repo.name,
                self.script_directory.display()
            );
            return ScriptResult::NotFound {
                script: script.to_string(),
            };
        };

        info!("Delegating {} to script {}", repo.name, path.display());
        let env = self.environment(repo);
        debug!(
            "Script environment: {}",
            env.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ")
        );

        self.run(&path, env).await
    }

    async fn run(&self, path: &Path, env: Vec<(String, String)>) -> ScriptResult {
        // stderr shares the stdout pipe so the output keeps its interleaving
        let output = AsyncCommand::new("bash")
            .arg("-c")
            .arg("exec bash \"$0\" 2>&1")
            .arg(path)
            .envs(env)
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to start script {}: {}", path.display(), e);
                return ScriptResult::Failure {
                    status: None,
                    output: e.to_string(),
                };
            }
        };

        let combined = String::from_utf8_lossy(&output.stdout).into_owned();

        for line in combined.lines() {
            info!("[{}] {}", path.display(), line);
        }

        if output.status.success() {
            ScriptResult::Success { output: combined }
        } else {
            warn!("Script {} exited with {}", path.display(), output.status);
            ScriptResult::Failure {
                status: output.status.code(),
                output: combined,
            }
        }
    }
}

/// Quote `s` so a POSIX shell reads it back as exactly one token.
///
/// Strings made only of safe characters are returned unchanged; anything
/// else is wrapped in single quotes with embedded quotes spliced out.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }

    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if s.chars().all(safe) {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
