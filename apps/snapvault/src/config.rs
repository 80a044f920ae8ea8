//! # Configuration
//!
//! `snapvault.toml`, all sections optional. A missing file means defaults.
//!
//! Precedence, lowest first: file, environment (`SNAPVAULT_ROOT`,
//! `SNAPVAULT_BACKEND`), command-line flags.

use serde::Deserialize;
use snapvault_core::primitives::{
    DEFAULT_CAS_RETRIES, DEFAULT_ESSENTIAL_TOKENS, DEFAULT_MAX_VERSIONS,
    DEFAULT_RETENTION_INTERVAL_SECS, DEFAULT_REQUIRED_TOKENS, DEFAULT_TTL_SECS,
};
use snapvault_core::{
    Backend, CanonicalPolicy, Canonicalizer, RetentionPolicy, Vault, VaultError, VaultOptions,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "snapvault.toml";

// -----------------------------------------------------------------------------
// Config (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub canonical: CanonicalConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SNAPVAULT_ROOT` / `SNAPVAULT_BACKEND` from the environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            std::env::var("SNAPVAULT_ROOT").ok().map(PathBuf::from),
            std::env::var("SNAPVAULT_BACKEND").ok(),
        )
    }

    /// Override the store location; empty values are ignored.
    pub fn apply_overrides(
        &mut self,
        root: Option<PathBuf>,
        backend: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = root.filter(|r| !r.as_os_str().is_empty()) {
            self.store.root = root;
        }
        if let Some(backend) = backend.filter(|b| !b.trim().is_empty()) {
            self.store.backend = backend
                .parse()
                .map_err(|e: VaultError| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.max_versions == 0 {
            return Err(ConfigError::Invalid(
                "retention.max_versions must be at least 1".to_string(),
            ));
        }
        if self.ingest.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ingest.request_timeout_ms must be positive".to_string(),
            ));
        }
        self.canonicalizer().map(|_| ())
    }

    pub fn canonicalizer(&self) -> Result<Canonicalizer, ConfigError> {
        let policy = CanonicalPolicy::new(
            self.canonical.essential.iter().cloned(),
            self.canonical.required.iter().cloned(),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Canonicalizer::new(policy))
    }

    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            retention: RetentionPolicy {
                ttl: Duration::from_secs(self.retention.ttl_secs),
                max_versions: self.retention.max_versions,
            },
            cas_retries: self.ingest.cas_retries,
            inline_retention: self.retention.inline,
        }
    }

    /// Open the configured store as a [`Vault`].
    pub fn open_vault(&self) -> Result<Vault, ConfigError> {
        let vault = Vault::open(
            self.store.backend,
            &self.store.root,
            self.canonicalizer()?,
            self.vault_options(),
        )?;
        tracing::info!(
            backend = self.store.backend.as_str(),
            root = %self.store.root.display(),
            "Store opened"
        );
        Ok(vault)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest.request_timeout_ms)
    }

    /// Interval of the periodic retention pass; `None` when disabled.
    pub fn retention_interval(&self) -> Option<Duration> {
        (self.retention.interval_secs > 0).then(|| Duration::from_secs(self.retention.interval_secs))
    }
}

// -----------------------------------------------------------------------------
// StoreConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub backend: Backend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            backend: Backend::default(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("snapvault-data")
}

// -----------------------------------------------------------------------------
// CanonicalConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalConfig {
    #[serde(default = "default_essential")]
    pub essential: Vec<String>,
    #[serde(default = "default_required")]
    pub required: Vec<String>,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self {
            essential: default_essential(),
            required: default_required(),
        }
    }
}

fn default_essential() -> Vec<String> {
    DEFAULT_ESSENTIAL_TOKENS.iter().map(|s| s.to_string()).collect()
}

fn default_required() -> Vec<String> {
    DEFAULT_REQUIRED_TOKENS.iter().map(|s| s.to_string()).collect()
}

// -----------------------------------------------------------------------------
// RetentionConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub inline: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_versions: default_max_versions(),
            interval_secs: default_interval_secs(),
            inline: true,
        }
    }
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_max_versions() -> usize {
    DEFAULT_MAX_VERSIONS
}

fn default_interval_secs() -> u64 {
    DEFAULT_RETENTION_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

// -----------------------------------------------------------------------------
// IngestConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            cas_retries: default_cas_retries(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_cas_retries() -> u32 {
    DEFAULT_CAS_RETRIES
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
