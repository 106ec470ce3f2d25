//! Repository Registry - immutable map of repository name to declared configuration
//!
//! Entries come from an INI file (one section per repository) and/or the
//! `repositories` map of the YAML configuration. Every unset field is
//! defaulted from [`ConventionConfig`] while loading, so consumers only ever
//! see fully resolved [`RepositoryConfig`] values. The registry is never
//! mutated after [`Registry::load`] returns.

use ini::Ini;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{Config, ConventionConfig};
use crate::error::RegistryError;

/// Section name that carries shared settings rather than a repository
const DEFAULT_SECTION: &str = "DEFAULT";

/// A repository as declared, before defaults are applied
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct RepositoryEntry {
    /// Working copy location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Clone/fetch source
    #[serde(default, alias = "remote_url", skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,

    /// Tracked branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Private key file or bare key name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Script that replaces built-in synchronization
    #[serde(default, alias = "cmd", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// A fully defaulted registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_url: String,
    pub branch: String,
    pub auth_key: Option<String>,
    pub script: Option<String>,
}

impl RepositoryConfig {
    /// The ref a push must carry to trigger this repository
    pub fn expected_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

impl RepositoryEntry {
    /// Apply naming conventions to every unset field
    pub fn resolve(
        &self,
        name: &str,
        conventions: &ConventionConfig,
    ) -> Result<RepositoryConfig, RegistryError> {
        let local_path = match non_empty(&self.path) {
            Some(path) => PathBuf::from(expand(name, "path", path)?),
            None => Path::new(&conventions.base_directory).join(name),
        };

        let remote_url = match (non_empty(&self.remote_path), &conventions.remote_url_template) {
            (Some(remote), _) => remote.to_string(),
            (None, Some(template)) => template.replace("{name}", name),
            (None, None) => {
                return Err(RegistryError::MissingRemote {
                    name: name.to_string(),
                })
            }
        };

        let branch = non_empty(&self.branch)
            .unwrap_or(&conventions.default_branch)
            .to_string();

        let auth_key = non_empty(&self.key)
            .map(|key| expand(name, "key", key))
            .transpose()?;

        let script = non_empty(&self.script)
            .map(|script| expand(name, "script", script))
            .transpose()?;

        Ok(RepositoryConfig {
            name: name.to_string(),
            local_path,
            remote_url,
            branch,
            auth_key,
            script,
        })
    }
}

/// Read-only set of registered repositories, in declaration order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RepositoryConfig>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Build the registry from configuration.
    ///
    /// `repositories_file` overrides `config.repositories_file` when given.
    /// INI sections come first, followed by the inline YAML entries.
    pub fn load(config: &Config, repositories_file: Option<&Path>) -> Result<Self, RegistryError> {
        let mut declared = Vec::new();

        let file = repositories_file
            .map(Path::to_path_buf)
            .or_else(|| config.repositories_file.as_ref().map(PathBuf::from));

        if let Some(file) = file {
            declared.extend(read_ini(&file)?);
        }

        declared.extend(
            config
                .repositories
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone())),
        );

        let registry = Self::build(declared, &config.conventions)?;
        if registry.is_empty() {
            warn!("No repositories are registered; every push will be rejected");
        }
        Ok(registry)
    }

    /// Build a registry from declared entries, applying conventions
    pub fn build(
        declared: impl IntoIterator<Item = (String, RepositoryEntry)>,
        conventions: &ConventionConfig,
    ) -> Result<Self, RegistryError> {
        let mut registry = Registry::default();

        for (name, entry) in declared {
            if name == DEFAULT_SECTION {
                continue;
            }
            if registry.index.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }

            let repo = entry.resolve(&name, conventions)?;
            debug!(
                "Registered {}: {} ({}) -> {}",
                repo.name,
                repo.remote_url,
                repo.branch,
                repo.local_path.display()
            );

            registry.index.insert(name, registry.entries.len());
            registry.entries.push(repo);
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryConfig> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepositoryConfig> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read repository sections from an INI file
pub fn read_ini(path: &Path) -> Result<Vec<(String, RepositoryEntry)>, RegistryError> {
    if !path.is_file() {
        return Err(RegistryError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    parse_ini(&content, path)
}

/// Parse repository sections from INI text. `origin` is only used in errors and logs.
pub fn parse_ini(content: &str, origin: &Path) -> Result<Vec<(String, RepositoryEntry)>, RegistryError> {
    let ini = Ini::load_from_str(content).map_err(|e| RegistryError::Parse {
        path: origin.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut declared = Vec::new();

    // The section-less block holds no repository
    for (section, properties) in ini.iter().filter_map(|(s, p)| s.map(|s| (s, p))) {
        if section == DEFAULT_SECTION {
            continue;
        }

        let mut entry = RepositoryEntry::default();
        for (key, value) in properties.iter() {
            let value = Some(value.trim().to_string());
            match key {
                "path" => entry.path = value,
                "remote_path" | "remote_url" => entry.remote_path = value,
                "branch" => entry.branch = value,
                "key" => entry.key = value,
                "script" | "cmd" => entry.script = value,
                other => warn!(
                    "Ignoring unknown key '{}' in section [{}] of {}",
                    other,
                    section,
                    origin.display()
                ),
            }
        }

        declared.push((section.to_string(), entry));
    }

    Ok(declared)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn expand(name: &str, field: &'static str, value: &str) -> Result<String, RegistryError> {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .map_err(|e| RegistryError::Expand {
            name: name.to_string(),
            field,
            message: e.to_string(),
        })
}
