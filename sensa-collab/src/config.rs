//! Client and relay configuration.
//!
//! Every struct has a `Default`, a `for_testing()` variant with short
//! timers, and can be read from TOML where missing keys fall back to the
//! defaults.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Parse a config section from TOML text and validate it.
pub fn from_toml_str<T>(text: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Validate,
{
    let config: T = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

fn non_zero(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

/// Options for one [`CollabContext`](crate::CollabContext).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Events buffered per channel subscriber before it starts lagging.
    pub channel_capacity: usize,
    /// Minimum spacing between published cursor positions.
    pub cursor_debounce_ms: u64,
    /// Presence tick: flushes the trailing cursor and prunes stale peers.
    pub presence_tick_ms: u64,
    /// Presence records older than this are dropped.
    pub presence_liveness_secs: u64,
    pub auto_save_interval_secs: u64,
    /// How long a broadcast waits for the relay's acknowledgment.
    pub ack_timeout_ms: u64,
    /// Ping interval on WebSocket connections.
    pub heartbeat_interval_secs: u64,
    /// Write acknowledged operations to the backing store.
    pub persist_operations: bool,
    /// End sessions that don't persist when empty once the last participant leaves.
    pub end_empty_sessions: bool,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            cursor_debounce_ms: 75,
            presence_tick_ms: 250,
            presence_liveness_secs: 30,
            auto_save_interval_secs: 300,
            ack_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            persist_operations: true,
            end_empty_sessions: true,
        }
    }
}

impl CollabConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            cursor_debounce_ms: 10,
            presence_tick_ms: 20,
            presence_liveness_secs: 2,
            auto_save_interval_secs: 1,
            ack_timeout_ms: 1_000,
            heartbeat_interval_secs: 5,
            ..Self::default()
        }
    }

    pub fn cursor_debounce(&self) -> Duration {
        Duration::from_millis(self.cursor_debounce_ms)
    }

    pub fn presence_tick(&self) -> Duration {
        Duration::from_millis(self.presence_tick_ms)
    }

    pub fn presence_liveness(&self) -> Duration {
        Duration::from_secs(self.presence_liveness_secs)
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Validate for CollabConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.channel_capacity as u64, "channel_capacity")?;
        non_zero(self.presence_tick_ms, "presence_tick_ms")?;
        non_zero(self.presence_liveness_secs, "presence_liveness_secs")?;
        non_zero(self.auto_save_interval_secs, "auto_save_interval_secs")?;
        non_zero(self.ack_timeout_ms, "ack_timeout_ms")?;
        non_zero(self.heartbeat_interval_secs, "heartbeat_interval_secs")
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Members allowed on one topic.
    pub max_members_per_topic: usize,
    /// Broadcast channel capacity per topic.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_topic: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_members_per_topic: 16,
            broadcast_capacity: 64,
        }
    }
}

impl Validate for RelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.max_members_per_topic as u64, "max_members_per_topic")?;
        non_zero(self.broadcast_capacity as u64, "broadcast_capacity")
    }
}
