//! Chat session configuration.
//!
//! Stored as camelCase JSON. Every field has a default, so a partial file
//! (or `{}`) is a valid config.

use crate::error::{ChatError, Result};
use nostr_client::{DEFAULT_RELAYS, PoolConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Relay URLs the pool connects to
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// How far back a channel join reaches, in seconds
    #[serde(default = "default_history_window_secs")]
    pub history_window_secs: u64,

    /// Maximum backlog events requested per join or room fetch
    #[serde(default = "default_history_limit")]
    pub history_limit: u64,

    /// How far back the join presence query reaches, in seconds
    #[serde(default = "default_presence_window_secs")]
    pub presence_window_secs: u64,

    /// Aggregate completion wait for channel joins
    #[serde(default = "default_join_wait_ms")]
    pub join_wait_ms: u64,

    /// Aggregate completion wait for room fetches and searches
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,

    /// Per-relay connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts before a relay is given up on
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Linear reconnect step
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Capacity of each observer broadcast channel
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|url| url.to_string()).collect()
}

fn default_history_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_history_limit() -> u64 {
    100
}

fn default_presence_window_secs() -> u64 {
    5 * 60
}

fn default_join_wait_ms() -> u64 {
    3_000
}

fn default_fetch_wait_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_observer_capacity() -> usize {
    1000
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            history_window_secs: default_history_window_secs(),
            history_limit: default_history_limit(),
            presence_window_secs: default_presence_window_secs(),
            join_wait_ms: default_join_wait_ms(),
            fetch_wait_ms: default_fetch_wait_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            observer_capacity: default_observer_capacity(),
        }
    }
}

impl ChatConfig {
    /// Defaults with a custom relay set.
    pub fn with_relays(relays: Vec<String>) -> Self {
        Self {
            relays,
            ..Self::default()
        }
    }

    pub fn join_wait(&self) -> Duration {
        Duration::from_millis(self.join_wait_ms)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    /// Pool settings derived from this config.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            relay: RelayConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            },
            join_wait: self.join_wait(),
            fetch_wait: self.fetch_wait(),
        }
    }
}

/// Load a config file. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<ChatConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ChatConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
}

/// Write a config file, creating parent directories.
pub fn save_config(path: impl AsRef<Path>, config: &ChatConfig) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ChatError::Config(e.to_string()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ChatError::Config(e.to_string()))
}
