//! Configuration loading.
//!
//! Config files are TOML. Any value may reference the process
//! environment with `${NAME}` or `${NAME:default}`; interpolation runs
//! over the raw file before parsing, so credentials never need to be
//! written into the file itself. All validation happens here or in the
//! factory; nothing fails lazily on first use.

use std::env;
use std::path::Path;

use serde::Deserialize;

use seekwell_core::engine::{IndexerConfig, DEFAULT_BATCH_SIZE};
use seekwell_core::minhash::{
    LshConfig, DEFAULT_BANDS, DEFAULT_SHINGLE_SIZE, DEFAULT_SIGNATURE_SIZE,
};
use seekwell_core::{Result, StoreError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub index: Option<IndexConfig>,
    #[serde(default)]
    pub lsh: LshSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `embedded` or `networked`.
    pub kind: String,
    pub embedded: Option<EmbeddedConfig>,
    pub networked: Option<NetworkedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedConfig {
    /// Database file path; parent directories are created on open.
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkedConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

/// External vector-index service. Optional; without it the networked
/// backend declines vector operations.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    pub url: String,
    pub collection: String,
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LshSettings {
    #[serde(default = "default_signature_size")]
    pub signature_size: usize,
    #[serde(default = "default_bands")]
    pub bands: usize,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for LshSettings {
    fn default() -> Self {
        Self {
            signature_size: DEFAULT_SIGNATURE_SIZE,
            bands: DEFAULT_BANDS,
            shingle_size: DEFAULT_SHINGLE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl LshSettings {
    pub fn lsh_config(&self) -> LshConfig {
        LshConfig {
            shingle_size: self.shingle_size,
            signature_size: self.signature_size,
            bands: self.bands,
        }
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            lsh: self.lsh_config(),
            batch_size: self.batch_size,
        }
    }
}

fn default_pool_size() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_index_timeout_secs() -> u64 {
    30
}

fn default_signature_size() -> usize {
    DEFAULT_SIGNATURE_SIZE
}

fn default_bands() -> usize {
    DEFAULT_BANDS
}

fn default_shingle_size() -> usize {
    DEFAULT_SHINGLE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Config {
    /// Parse a config document: interpolate, deserialize, validate.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let interpolated = interpolate(raw)?;
        let config: Config = toml::from_str(&interpolated)
            .map_err(|e| StoreError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        match self.database.kind.as_str() {
            "embedded" => {
                if self.database.embedded.is_none() {
                    return Err(StoreError::Configuration(
                        "database.kind is 'embedded' but [database.embedded] is missing".into(),
                    ));
                }
            }
            "networked" => {
                if self.database.networked.is_none() {
                    return Err(StoreError::Configuration(
                        "database.kind is 'networked' but [database.networked] is missing".into(),
                    ));
                }
            }
            other => {
                return Err(StoreError::Configuration(format!(
                    "unknown database kind '{other}' (expected 'embedded' or 'networked')"
                )));
            }
        }
        self.lsh.lsh_config().validate()?;
        if self.lsh.batch_size == 0 {
            return Err(StoreError::Configuration(
                "lsh batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${NAME}` and `${NAME:default}` against the environment.
///
/// A reference without a default to a variable that is unset is a
/// configuration error.
pub fn interpolate(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or_else(|| {
            StoreError::Configuration("unterminated ${...} in config".into())
        })?;
        let inner = &tail[..end];
        let (name, default) = match inner.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };
        match env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => {
                    return Err(StoreError::Configuration(format!(
                        "environment variable {name} is not set and has no default"
                    )));
                }
            },
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
