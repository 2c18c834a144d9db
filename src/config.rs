//! Configuration management for the vehicle ledger

use crate::blockchain::{ProofOfWork, DEFAULT_MAX_NONCE, DEFAULT_POW_PREFIX};
use crate::error::{LedgerError, Result};
use crate::voting::VoterSets;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "ledger.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub voters: VotersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// SQLite file, or directory for the JSON backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_pow_prefix")]
    pub pow_prefix: String,
    #[serde(default = "default_max_nonce")]
    pub max_nonce: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            pow_prefix: default_pow_prefix(),
            max_nonce: default_max_nonce(),
        }
    }
}

impl ConsensusConfig {
    pub fn proof_of_work(&self) -> Result<ProofOfWork> {
        ProofOfWork::new(self.pow_prefix.clone(), self.max_nonce)
    }
}

/// Seed membership for a brand-new ledger. Ignored once state has been stored.
#[derive(Debug, Clone, Deserialize)]
pub struct VotersConfig {
    #[serde(default = "default_admins")]
    pub admins: Vec<String>,
    #[serde(default)]
    pub garages: Vec<String>,
}

impl Default for VotersConfig {
    fn default() -> Self {
        Self {
            admins: default_admins(),
            garages: Vec::new(),
        }
    }
}

impl VotersConfig {
    pub fn voter_sets(&self) -> VoterSets {
        VoterSets::new(self.admins.iter().cloned(), self.garages.iter().cloned())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_storage_path() -> String {
    "./data/ledger.db".to_string()
}

fn default_pow_prefix() -> String {
    DEFAULT_POW_PREFIX.to_string()
}

fn default_max_nonce() -> u64 {
    DEFAULT_MAX_NONCE
}

fn default_admins() -> Vec<String> {
    vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse and validate a configuration document.
pub fn parse_config(config_str: &str) -> Result<Config> {
    let config: Config = toml::from_str(config_str)?;
    validate(&config)?;
    Ok(config)
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = match fs::read_to_string(path.as_ref()) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(LedgerError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            )))
        }
    };
    parse_config(&config_str)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.backend != StorageBackend::Memory && config.storage.path.trim().is_empty() {
        return Err(LedgerError::Config("storage.path must be set".to_string()));
    }

    config.consensus.proof_of_work()?;

    if config.voters.admins.iter().any(|a| a.trim().is_empty())
        || config.voters.garages.iter().any(|g| g.trim().is_empty())
    {
        return Err(LedgerError::Config("voter identities must not be empty".to_string()));
    }

    if config.logging.level.parse::<tracing::Level>().is_err() {
        return Err(LedgerError::Config(format!(
            "logging.level {:?} is not a valid level",
            config.logging.level
        )));
    }

    Ok(())
}
