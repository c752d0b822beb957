//! Configuration system for Portage.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PORTAGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/portage/config.toml
//!   3. ~/.config/portage/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the x25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address sessions listen on. Port 0 = OS-assigned.
    pub listen_addr: String,
    /// UDP port for discovery datagrams.
    pub discovery_port: u16,
    /// Seconds between discovery announcements.
    pub announce_interval_secs: u64,
    /// Peers silent for longer than this are removed from the registry.
    pub peer_ttl_secs: u64,
    /// Seconds of outbound silence before a heartbeat is sent.
    /// 3x this with no inbound traffic disconnects the session.
    pub heartbeat_interval_secs: u64,
    /// Seconds to complete the handshake + key exchange.
    pub handshake_timeout_secs: u64,
    /// Outbound envelopes queued per session before producers see Busy.
    pub session_queue_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for chunks/, files/, and meta/.
    pub data_dir: PathBuf,
    /// Root for incoming/ partial files.
    pub temp_dir: PathBuf,
    /// Chunks at or above this size are gzip-compressed at rest.
    pub compress_threshold: usize,
    /// Orphaned chunks and temp files older than this are cleaned up.
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for locally imported files.
    pub chunk_size: u64,
    /// Largest file a peer may offer us.
    pub max_file_size: u64,
    /// Outstanding unacknowledged chunks per transfer.
    pub max_concurrent_chunks: usize,
    /// Resend attempts per sequence before the transfer fails.
    pub max_retries: u32,
    /// Seconds before an unacknowledged chunk is resent.
    pub chunk_timeout_secs: u64,
    /// Seconds before a whole transfer is abandoned.
    pub transfer_timeout_secs: u64,
    /// Seconds before an unanswered TransferRequest fails.
    pub request_timeout_secs: u64,
    /// Seconds between progress reports to the observer.
    pub progress_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            discovery_port: 47800,
            announce_interval_secs: 2,
            peer_ttl_secs: 10,
            heartbeat_interval_secs: 10,
            handshake_timeout_secs: 30,
            session_queue_limit: 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
            temp_dir: std::env::temp_dir().join("portage"),
            compress_threshold: 1024,
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_file_size: 10 * 1024 * 1024 * 1024,
            max_concurrent_chunks: 8,
            max_retries: 3,
            chunk_timeout_secs: 30,
            transfer_timeout_secs: 30 * 60,
            request_timeout_secs: 30,
            progress_interval_secs: 1,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("portage")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("portage")
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

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PORTAGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PORTAGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTAGE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("PORTAGE_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PORTAGE_STORAGE__TEMP_DIR") {
            self.storage.temp_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PORTAGE_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_TRANSFER__MAX_FILE_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.max_file_size = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_limits() {
        let config = NodeConfig::default();
        assert_eq!(config.transfer.chunk_size, 65_536);
        assert_eq!(config.transfer.max_concurrent_chunks, 8);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.chunk_timeout_secs, 30);
        assert_eq!(config.transfer.transfer_timeout_secs, 1800);
        assert_eq!(config.network.heartbeat_interval_secs, 10);
        assert_eq!(config.network.session_queue_limit, 1024);
        assert_eq!(config.storage.compress_threshold, 1024);
        assert_eq!(config.storage.max_age_secs, 86_400);
    }

    #[test]
    fn config_toml_round_trip() {
        let config = NodeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.transfer.chunk_size, config.transfer.chunk_size);
        assert_eq!(back.network.discovery_port, config.network.discovery_port);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let back: NodeConfig = toml::from_str("[transfer]\nchunk_size = 8192\n").unwrap();
        assert_eq!(back.transfer.chunk_size, 8192);
        assert_eq!(back.transfer.max_retries, 3);
    }
}
