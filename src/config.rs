//! Configuration module for per-run settings
//!
//! Settings are read through a [`ConfigSource`] at the start of every run and
//! never cached across runs, so externally rotated credentials take effect on
//! the next invocation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::{MoverError, Result};

pub const SOURCE_TOKEN_VAR: &str = "GITHUB_TOKEN";
pub const SOURCE_TOKEN_REQUIRED_VAR: &str = "SOURCE_TOKEN_REQUIRED";
pub const TARGET_REPO_VAR: &str = "TARGET_REPO";
pub const TARGET_USER_VAR: &str = "TARGET_USER";
pub const TARGET_PWD_VAR: &str = "TARGET_PWD";
pub const POLICY_PATH_VAR: &str = "POLICY_PATH";
pub const SCRATCH_DIR_VAR: &str = "IMAGE_MOVER_SCRATCH_DIR";
pub const INSECURE_REGISTRIES_VAR: &str = "IMAGE_MOVER_INSECURE_REGISTRIES";
pub const SKIP_TLS_VAR: &str = "IMAGE_MOVER_SKIP_TLS";
pub const HTTP_TIMEOUT_VAR: &str = "IMAGE_MOVER_HTTP_TIMEOUT_SECS";

/// Read-only lookup of configuration values.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads configuration from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed in-memory configuration, mostly for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Username/password pair for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Destination registry coordinates plus credentials.
#[derive(Clone)]
pub struct TransferCredentials {
    pub repository: String,
    pub auth: AuthConfig,
}

impl fmt::Debug for TransferCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCredentials")
            .field("repository", &self.repository)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Settings for downloading the source artifact.
#[derive(Clone, Default)]
pub struct SourceConfig {
    pub token: Option<String>,
    pub require_token: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("require_token", &self.require_token)
            .finish()
    }
}

/// Transport options for talking to the destination registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub insecure_registries: Vec<String>,
    pub skip_tls: bool,
    pub timeout: Option<Duration>,
}

impl RegistryOptions {
    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure_registries.iter().any(|h| h == host)
    }
}

/// Everything one run needs, captured at run start.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: SourceConfig,
    pub repository: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub policy_path: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub registry: RegistryOptions,
}

impl RunConfig {
    pub fn load(source: &dyn ConfigSource) -> Self {
        let non_empty = |key: &str| source.get(key).filter(|v| !v.is_empty());

        let require_token = parse_bool(source, SOURCE_TOKEN_REQUIRED_VAR).unwrap_or(true);
        let skip_tls = parse_bool(source, SKIP_TLS_VAR).unwrap_or(false);

        let timeout = non_empty(HTTP_TIMEOUT_VAR).and_then(|v| match v.parse::<u64>() {
            Ok(0) | Err(_) => {
                warn!(variable = HTTP_TIMEOUT_VAR, value = %v, "ignoring invalid timeout");
                None
            }
            Ok(secs) => Some(Duration::from_secs(secs)),
        });

        let insecure_registries = non_empty(INSECURE_REGISTRIES_VAR)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        RunConfig {
            source: SourceConfig {
                token: non_empty(SOURCE_TOKEN_VAR),
                require_token,
            },
            repository: non_empty(TARGET_REPO_VAR),
            username: non_empty(TARGET_USER_VAR),
            password: non_empty(TARGET_PWD_VAR),
            policy_path: non_empty(POLICY_PATH_VAR).map(PathBuf::from),
            scratch_dir: non_empty(SCRATCH_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            registry: RegistryOptions {
                insecure_registries,
                skip_tls,
                timeout,
            },
        }
    }

    /// Destination repository and credentials, each checked in turn.
    pub fn transfer_credentials(&self) -> Result<TransferCredentials> {
        let repository = self
            .repository
            .clone()
            .ok_or(MoverError::MissingConfiguration {
                variable: TARGET_REPO_VAR,
            })?;
        let username = self
            .username
            .clone()
            .ok_or(MoverError::MissingConfiguration {
                variable: TARGET_USER_VAR,
            })?;
        let password = self
            .password
            .clone()
            .ok_or(MoverError::MissingConfiguration {
                variable: TARGET_PWD_VAR,
            })?;

        Ok(TransferCredentials {
            repository,
            auth: AuthConfig::new(username, password),
        })
    }
}

fn parse_bool(source: &dyn ConfigSource, key: &str) -> Option<bool> {
    let value = source.get(key)?;
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        "" => None,
        _ => {
            warn!(variable = key, value = %value, "ignoring invalid boolean");
            None
        }
    }
}
