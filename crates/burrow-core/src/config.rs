//! Configuration system for Burrow.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BURROW_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/burrow/config.toml
//!   3. ~/.config/burrow/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    pub conversation: ConversationSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Messages kept per conversation. Oldest entries beyond this are pruned.
    pub history_limit: usize,
    /// Send attempts for a chat message before it is marked as failed.
    pub max_send_attempts: u8,
    /// Send attempts for a file message before it is marked as failed.
    pub max_file_attempts: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Parent of the per-transfer staging directories.
    pub staging_root: PathBuf,
    /// Where reassembled incoming files are written.
    pub downloads_dir: PathBuf,
    /// Largest incoming file accepted, in bytes. 0 = unlimited.
    pub max_file_size: u64,
    /// Sends of a single chunk (or header) before the transfer fails.
    pub max_chunk_attempts: u8,
    /// Seconds without an acknowledgement before a chunk is resent.
    pub chunk_stall_secs: u64,
    /// Seconds without a chunk before an incoming transfer is abandoned.
    pub incoming_timeout_secs: u64,
    /// How often the stall sweep runs.
    pub sweep_interval_secs: u64,
    /// Incoming transfers in progress at once, per peer.
    pub max_incoming_transfers: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            max_send_attempts: 2,
            max_file_attempts: 8,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir(),
            downloads_dir: data_dir().join("downloads"),
            max_file_size: 0,
            max_chunk_attempts: 5,
            chunk_stall_secs: 30,
            incoming_timeout_secs: 600,
            sweep_interval_secs: 5,
            max_incoming_transfers: 16,
        }
    }
}

impl TransferSettings {
    pub fn chunk_stall(&self) -> Duration {
        Duration::from_secs(self.chunk_stall_secs)
    }

    pub fn incoming_timeout(&self) -> Duration {
        Duration::from_secs(self.incoming_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("burrow")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("burrow")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BurrowConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a config file without env overrides. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(BurrowConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BURROW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&BurrowConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply BURROW_* overrides. `lookup` is `std::env::var` in production.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BURROW_CONVERSATION__HISTORY_LIMIT") {
            if let Ok(n) = v.parse() {
                self.conversation.history_limit = n;
            }
        }
        if let Some(v) = lookup("BURROW_TRANSFER__STAGING_ROOT") {
            self.transfer.staging_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("BURROW_TRANSFER__DOWNLOADS_DIR") {
            self.transfer.downloads_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BURROW_TRANSFER__MAX_CHUNK_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.transfer.max_chunk_attempts = n;
            }
        }
        if let Some(v) = lookup("BURROW_TRANSFER__CHUNK_STALL_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_stall_secs = n;
            }
        }
    }
}
