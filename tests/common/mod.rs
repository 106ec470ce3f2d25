//! Common test utilities: local git remotes, pushes and registries
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use pushsync::config::{Config, ConventionConfig, SyncConfig};
use pushsync::{Registry, RepositoryEntry, SyncEngine};

/// Run git in `dir`, panicking with its stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=pushsync tests",
            "-c",
            "user.email=tests@pushsync.invalid",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to execute git");

    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Commit `HEAD` resolves to in `dir`
pub fn head(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

/// Branch checked out in `dir`
pub fn current_branch(dir: &Path) -> String {
    git(dir, &["symbolic-ref", "--short", "HEAD"])
}

/// A scratch area holding bare remotes, a seed clone used to push to them,
/// and the directories the engine works in.
pub struct GitFixture {
    pub root: TempDir,
}

impl GitFixture {
    pub fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        for dir in ["remotes", "seeds", "www", "keys", "scripts"] {
            std::fs::create_dir_all(root.path().join(dir)).expect("Failed to create fixture dir");
        }
        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn remote(&self, name: &str) -> PathBuf {
        self.path().join("remotes").join(format!("{}.git", name))
    }

    pub fn working_copy(&self, name: &str) -> PathBuf {
        self.path().join("www").join(name)
    }

    pub fn script_dir(&self) -> PathBuf {
        self.path().join("scripts")
    }

    fn seed(&self, name: &str) -> PathBuf {
        self.path().join("seeds").join(name)
    }

    /// Create a bare remote whose default branch is `main`
    pub fn create_remote(&self, name: &str) -> PathBuf {
        let remote = self.remote(name);
        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "-q", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let seed = self.seed(name);
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);

        remote
    }

    /// Commit `content` to `file` on `branch` of remote `name` and push it
    pub fn push_commit(&self, name: &str, branch: &str, file: &str, content: &str) -> String {
        let seed = self.seed(name);
        let has_commits = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .current_dir(&seed)
            .output()
            .unwrap()
            .status
            .success();

        if !has_commits {
            git(&seed, &["symbolic-ref", "HEAD", &format!("refs/heads/{}", branch)]);
        } else if current_branch(&seed) != branch {
            let exists = Command::new("git")
                .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
                .current_dir(&seed)
                .output()
                .unwrap()
                .status
                .success();
            if exists {
                git(&seed, &["checkout", "-q", branch]);
            } else {
                git(&seed, &["checkout", "-q", "-b", branch]);
            }
        }

        std::fs::write(seed.join(file), content).unwrap();
        git(&seed, &["add", file]);
        git(&seed, &["commit", "-q", "-m", &format!("update {}", file)]);
        git(&seed, &["push", "-q", "origin", &format!("HEAD:refs/heads/{}", branch)]);

        head(&seed)
    }

    pub fn conventions(&self) -> ConventionConfig {
        let remote_template = self.path().join("remotes").join("{name}.git");
        ConventionConfig {
            base_directory: self.path().join("www").display().to_string(),
            key_directory: self.path().join("keys").display().to_string(),
            script_directory: self.script_dir().display().to_string(),
            default_branch: "master".to_string(),
            remote_url_template: Some(remote_template.display().to_string()),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            conventions: self.conventions(),
            sync: SyncConfig {
                timeout: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn registry(&self, entries: Vec<(&str, RepositoryEntry)>) -> Registry {
        Registry::build(
            entries.into_iter().map(|(name, entry)| (name.to_string(), entry)),
            &self.conventions(),
        )
        .expect("Failed to build registry")
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::from_config(&self.config())
    }

    /// Write an executable-by-bash script into the script directory
    pub fn write_script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.script_dir().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }
}

/// An entry that tracks `branch`
pub fn on_branch(branch: &str) -> RepositoryEntry {
    RepositoryEntry {
        branch: Some(branch.to_string()),
        ..Default::default()
    }
}
