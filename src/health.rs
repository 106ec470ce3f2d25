//! Preflight checks for `pushsync doctor`
//!
//! Verifies that git is available and that every registered repository's
//! key, script and working-copy location are usable before a push arrives.

use std::path::Path;

use crate::credentials::CredentialResolver;
use crate::git::GitClient;
use crate::registry::{Registry, RepositoryConfig};
use crate::script::ScriptDelegate;
use crate::Config;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Key directory status (warning only, bare key names need it)
    pub key_directory: CheckResult,
    /// Per-repository checks, in registry order
    pub repositories: Vec<RepositoryHealth>,
}

/// Checks for one registered repository
#[derive(Debug, Clone)]
pub struct RepositoryHealth {
    pub name: String,
    pub key: CheckResult,
    pub script: CheckResult,
    pub working_copy: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config, registry: &Registry) -> Self {
        let credentials = CredentialResolver::new(
            &config.conventions.key_directory,
            config.sync.verify_host_identity,
        );
        let scripts = ScriptDelegate::from_config(config, credentials.clone());

        Self {
            git: Self::check_git(),
            key_directory: Self::check_key_directory(&config.conventions.key_directory),
            repositories: registry
                .iter()
                .map(|repo| RepositoryHealth {
                    name: repo.name.clone(),
                    key: Self::check_key(&credentials, repo),
                    script: Self::check_script(&scripts, repo),
                    working_copy: Self::check_working_copy(&repo.local_path),
                })
                .collect(),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<(String, &CheckResult)> {
        self.all_checks()
            .into_iter()
            .filter(|(_, r)| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<(String, &CheckResult)> {
        self.all_checks()
            .into_iter()
            .filter(|(_, r)| r.is_warning)
            .collect()
    }

    /// Every check with a display label
    pub fn all_checks(&self) -> Vec<(String, &CheckResult)> {
        let mut checks = vec![
            ("Git Installation".to_string(), &self.git),
            ("Key Directory".to_string(), &self.key_directory),
        ];

        for repo in &self.repositories {
            checks.push((format!("{}: key", repo.name), &repo.key));
            checks.push((format!("{}: script", repo.name), &repo.script));
            checks.push((format!("{}: working copy", repo.name), &repo.working_copy));
        }

        checks
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_key_directory(key_directory: &str) -> CheckResult {
        if Path::new(key_directory).is_dir() {
            CheckResult::ok_with_details("Key directory exists", key_directory)
        } else {
            CheckResult::warning_with_details(
                "Key directory not found",
                format!("Bare key names cannot resolve. Run: mkdir -p {}", key_directory),
            )
        }
    }

    fn check_key(credentials: &CredentialResolver, repo: &RepositoryConfig) -> CheckResult {
        let Some(key) = repo.auth_key.as_deref() else {
            return CheckResult::ok("No key configured");
        };

        match credentials.resolve(key) {
            Ok(auth) => {
                CheckResult::ok_with_details("Key usable", auth.key_path().display().to_string())
            }
            Err(e) => CheckResult::error_with_details("Key unusable", e.to_string()),
        }
    }

    fn check_script(scripts: &ScriptDelegate, repo: &RepositoryConfig) -> CheckResult {
        let Some(script) = repo.script.as_deref() else {
            return CheckResult::ok("No script configured");
        };

        match scripts.locate(script) {
            Some(path) => CheckResult::ok_with_details("Script found", path.display().to_string()),
            None => CheckResult::warning_with_details(
                "Script not found",
                format!("'{}' is missing; built-in sync will be used", script),
            ),
        }
    }

    fn check_working_copy(path: &Path) -> CheckResult {
        if GitClient::is_repository(path) {
            return CheckResult::ok_with_details("Working copy present", path.display().to_string());
        }

        match path.parent() {
            Some(parent) if parent.is_dir() => CheckResult::ok_with_details(
                "Working copy will be cloned on first sync",
                path.display().to_string(),
            ),
            _ => CheckResult::warning_with_details(
                "Parent directory missing",
                format!("It will be created on first sync: {}", path.display()),
            ),
        }
    }
}
