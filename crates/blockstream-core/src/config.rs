//! Configuration for a BlockStream endpoint.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLOCKSTREAM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/blockstream/config.toml
//!   3. ~/.config/blockstream/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE, HANDSHAKE_TIMEOUT_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStreamConfig {
    pub transfer: TransferConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound on the combined block payload of one response batch.
    pub max_message_size: usize,
    /// Upper bound on one frame on the wire.
    pub max_frame_size: usize,
    /// Capacity of the collector's pending-request queue.
    pub collector_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persist every verified block received by a session into the local store.
    pub auto_save: bool,
    /// Seconds allowed for either side of the handshake.
    pub handshake_timeout_secs: u64,
    /// Capacity of the block channel returned to callers.
    pub output_buffer: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            collector_queue: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save: false,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
            output_buffer: 64,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("blockstream")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BlockStreamConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            BlockStreamConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLOCKSTREAM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Enable persisting of received blocks.
    pub fn with_auto_save(mut self) -> Self {
        self.session.auto_save = true;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.session.handshake_timeout_secs)
    }

    /// Apply BLOCKSTREAM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BLOCKSTREAM_SESSION__AUTO_SAVE") {
            self.session.auto_save = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_SESSION__HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.session.handshake_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_TRANSFER__MAX_MESSAGE_SIZE") {
            if let Ok(size) = v.parse() {
                self.transfer.max_message_size = size;
            }
        }
    }
}
