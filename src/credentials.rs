//! Credential Resolver - turns a key reference into git transport authentication
//!
//! A key reference is either a path to a private key or a bare key name that
//! is looked up in the configured key directory. The key is read and parsed
//! up front so that an unusable key fails the invocation
//! before any network traffic, instead of surfacing as an opaque ssh error.
//!
//! Authentication is handed to git through `GIT_SSH_COMMAND`. Whether the
//! remote host key is checked against `known_hosts` is controlled by
//! `sync.verify_host_identity`; turning it off trusts any host presenting
//! itself as the remote.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::CredentialError;
use crate::registry::RepositoryConfig;
use crate::script::shell_quote;

/// Environment variable git consults for the ssh command line
pub const GIT_SSH_COMMAND: &str = "GIT_SSH_COMMAND";

/// Key-based authentication for git over ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticator {
    key_path: PathBuf,
    verify_host_identity: bool,
}

impl Authenticator {
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// The ssh command line git should use for this key
    pub fn ssh_command(&self) -> String {
        ssh_command(&self.key_path, self.verify_host_identity)
    }

    /// Environment variables to set on git subprocesses
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(GIT_SSH_COMMAND.to_string(), self.ssh_command())]
    }
}

/// Builds an ssh command line that authenticates with exactly `key`
pub fn ssh_command(key: &Path, verify_host_identity: bool) -> String {
    let mut command = format!(
        "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
        shell_quote(&key.display().to_string())
    );

    if verify_host_identity {
        command.push_str(" -o StrictHostKeyChecking=yes");
    } else {
        command.push_str(" -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null");
    }

    command
}

/// Locates private keys and produces [`Authenticator`]s
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    key_directory: PathBuf,
    verify_host_identity: bool,
}

impl CredentialResolver {
    pub fn new(key_directory: impl Into<PathBuf>, verify_host_identity: bool) -> Self {
        Self {
            key_directory: key_directory.into(),
            verify_host_identity,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        if !config.sync.verify_host_identity {
            tracing::warn!(
                "Host identity verification is disabled; remotes are trusted without checking their host key"
            );
        }
        Self::new(
            &config.conventions.key_directory,
            config.sync.verify_host_identity,
        )
    }

    pub fn verify_host_identity(&self) -> bool {
        self.verify_host_identity
    }

    /// Paths tried for a key reference, in order
    pub fn candidates(&self, key_ref: &str) -> Vec<PathBuf> {
        let direct = PathBuf::from(key_ref);
        let in_directory = self.key_directory.join(key_ref);

        if direct == in_directory {
            vec![direct]
        } else {
            vec![direct, in_directory]
        }
    }

    /// First candidate path that is an existing file
    pub fn locate(&self, key_ref: &str) -> Option<PathBuf> {
        self.candidates(key_ref).into_iter().find(|p| p.is_file())
    }

    /// Where a key reference points, whether or not the file exists yet
    pub fn expected_path(&self, key_ref: &str) -> PathBuf {
        self.locate(key_ref)
            .unwrap_or_else(|| self.key_directory.join(key_ref))
    }

    /// Locate, read and inspect a private key
    pub fn resolve(&self, key_ref: &str) -> Result<Authenticator, CredentialError> {
        let key_path = self
            .locate(key_ref)
            .ok_or_else(|| CredentialError::KeyNotFound {
                key_ref: key_ref.to_string(),
                searched: self.candidates(key_ref),
            })?;

        let bytes = std::fs::read(&key_path).map_err(|e| CredentialError::KeyUnparseable {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;

        inspect_private_key(&bytes).map_err(|reason| CredentialError::KeyUnparseable {
            path: key_path.clone(),
            reason,
        })?;

        Ok(Authenticator {
            key_path,
            verify_host_identity: self.verify_host_identity,
        })
    }

    /// Authentication for a repository; `None` when it declares no key
    pub fn resolve_for(
        &self,
        repo: &RepositoryConfig,
    ) -> Result<Option<Authenticator>, CredentialError> {
        repo.auth_key
            .as_deref()
            .map(|key_ref| self.resolve(key_ref))
            .transpose()
    }
}

const PASSPHRASE_PROTECTED: &str = "passphrase-protected keys are not supported";

/// Parses `bytes` as an unencrypted OpenSSH, PKCS#1, SEC1 or PKCS#8 private key
fn inspect_private_key(bytes: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(bytes).map_err(|_| "not a text key file".to_string())?;
    let armor = Armor::parse(text)?;

    if armor.label == "OPENSSH PRIVATE KEY" {
        let key = ssh_key::PrivateKey::from_openssh(text)
            .map_err(|e| format!("invalid OpenSSH key: {}", e))?;
        if key.is_encrypted() {
            return Err(PASSPHRASE_PROTECTED.to_string());
        }
        return Ok(());
    }

    if armor.label == "ENCRYPTED PRIVATE KEY" || armor.encrypted {
        return Err(PASSPHRASE_PROTECTED.to_string());
    }

    let der = STANDARD
        .decode(armor.body.as_bytes())
        .map_err(|e| format!("invalid base64 body: {}", e))?;

    match armor.label {
        "RSA PRIVATE KEY" => pkcs1::RsaPrivateKey::try_from(der.as_slice())
            .map(drop)
            .map_err(|e| format!("invalid PKCS#1 RSA key: {}", e)),
        "EC PRIVATE KEY" => sec1::EcPrivateKey::try_from(der.as_slice())
            .map(drop)
            .map_err(|e| format!("invalid SEC1 EC key: {}", e)),
        "PRIVATE KEY" => pkcs8::PrivateKeyInfo::try_from(der.as_slice())
            .map(drop)
            .map_err(|e| format!("invalid PKCS#8 key: {}", e)),
        other => Err(format!("unsupported key type '{}'", other)),
    }
}

/// PEM armor of a private key file
struct Armor<'a> {
    label: &'a str,
    body: String,
    /// Legacy `Proc-Type: 4,ENCRYPTED` header present
    encrypted: bool,
}

impl<'a> Armor<'a> {
    fn parse(text: &'a str) -> Result<Self, String> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let header = lines.next().ok_or_else(|| "file is empty".to_string())?;
        let label = header
            .strip_prefix("-----BEGIN ")
            .and_then(|h| h.strip_suffix("-----"))
            .ok_or_else(|| "missing BEGIN marker".to_string())?;

        if !label.ends_with("PRIVATE KEY") {
            return Err(format!("expected a private key, found '{}'", label));
        }

        let footer = format!("-----END {}-----", label);
        let mut body = String::new();
        let mut encrypted = false;
        let mut closed = false;

        for line in lines {
            if line == footer {
                closed = true;
                break;
            }
            // RFC 1421 headers of legacy PEM keys
            if line.contains(':') {
                if line.starts_with("Proc-Type:") && line.contains("ENCRYPTED") {
                    encrypted = true;
                }
                continue;
            }
            body.push_str(line);
        }

        if !closed {
            return Err("missing END marker".to_string());
        }
        if body.is_empty() {
            return Err("key body is empty".to_string());
        }

        Ok(Self {
            label,
            body,
            encrypted,
        })
    }
}
