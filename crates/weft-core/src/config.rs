//! Configuration system for weft.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WEFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/weft/config.toml
//!   3. ~/.config/weft/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub node: NodeConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default hop budget stamped onto envelopes this node originates.
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Part size in bytes when splitting an origin download. Small enough
    /// for a single data-channel frame.
    pub chunk_size: usize,
    /// How long to wait for a useful mesh reply before downloading a file
    /// straight from its origin, in milliseconds.
    pub download_timeout_ms: u64,
    /// How many missing parts to request after each info round.
    pub request_batch: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self { ttl: 3 }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            download_timeout_ms: 5000,
            request_batch: 3,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("weft")
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

impl WeftConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            WeftConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WEFT_CONFIG")
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
            let text = toml::to_string_pretty(&WeftConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply WEFT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEFT_NODE__TTL") {
            if let Ok(ttl) = v.parse() {
                self.node.ttl = ttl;
            }
        }
        if let Ok(v) = std::env::var("WEFT_MEDIA__CHUNK_SIZE") {
            if let Ok(size) = v.parse() {
                self.media.chunk_size = size;
            }
        }
        if let Ok(v) = std::env::var("WEFT_MEDIA__DOWNLOAD_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.media.download_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("WEFT_MEDIA__REQUEST_BATCH") {
            if let Ok(n) = v.parse() {
                self.media.request_batch = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = WeftConfig::default();
        assert_eq!(config.node.ttl, 3);
        assert_eq!(config.media.chunk_size, 1000);
        assert_eq!(config.media.download_timeout_ms, 5000);
        assert_eq!(config.media.request_batch, 3);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: WeftConfig = toml::from_str("[node]\nttl = 7\n").unwrap();
        assert_eq!(config.node.ttl, 7);
        assert_eq!(config.media.chunk_size, 1000);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&WeftConfig::default()).unwrap();
        let back: WeftConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.media.download_timeout_ms, 5000);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("weft-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        std::env::set_var("WEFT_CONFIG", config_path.to_str().unwrap());

        let path = WeftConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        // Loading from it should give defaults.
        let config = WeftConfig::load().expect("load should succeed");
        assert_eq!(config.node.ttl, 3);
        assert_eq!(config.media.chunk_size, 1000);

        std::env::remove_var("WEFT_CONFIG");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
