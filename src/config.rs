//! Mesh timing and sizing configuration.
//!
//! Every field has a default matching the design values, so an empty JSON
//! object (or no file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// mDNS service name, registered as `_<name>._udp.local.`
    pub service_name: String,
    pub heartbeat_interval_ms: u64,
    /// Time without a successful send after which a peer is suspect
    pub connection_timeout_ms: u64,
    /// Wait after the probe before a suspect peer is evicted
    pub grace_period_ms: u64,
    /// Pause between stopping and restarting discovery during reconnection
    pub reconnect_settle_ms: u64,
    /// How long each reconnection attempt waits for the peer to come back
    pub reconnect_window_ms: u64,
    pub max_reconnection_attempts: u32,
    /// A send with no outcome after this long counts as failed
    pub send_timeout_ms: u64,
    /// Capacity of the transport event channel
    pub event_capacity: usize,
    pub max_message_bytes: usize,
    /// Development/simulation host: disambiguate the identity with a suffix
    pub simulated_host: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_name: "nearcast".to_string(),
            heartbeat_interval_ms: 1_000,
            connection_timeout_ms: 10_000,
            grace_period_ms: 5_000,
            reconnect_settle_ms: 1_000,
            reconnect_window_ms: 5_000,
            max_reconnection_attempts: 3,
            send_timeout_ms: 10_000,
            event_capacity: 1024,
            max_message_bytes: 64 * 1024,
            simulated_host: false,
        }
    }
}

impl MeshConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> MeshResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: MeshConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.service_name.is_empty() {
            return Err(MeshError::Config("service_name must not be empty".to_string()));
        }
        let nonzero = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("grace_period_ms", self.grace_period_ms),
            ("reconnect_window_ms", self.reconnect_window_ms),
            ("send_timeout_ms", self.send_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(MeshError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.max_reconnection_attempts == 0 {
            return Err(MeshError::Config(
                "max_reconnection_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconnect_window_ms < self.reconnect_settle_ms {
            return Err(MeshError::Config(
                "reconnect_window_ms must not be shorter than reconnect_settle_ms".to_string(),
            ));
        }
        if self.event_capacity == 0 || self.max_message_bytes == 0 {
            return Err(MeshError::Config(
                "event_capacity and max_message_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Full mDNS service type string
    pub fn service_type(&self) -> String {
        format!("_{}._udp.local.", self.service_name)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
