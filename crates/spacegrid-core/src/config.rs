//! spacegrid.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceGridConfig {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub events: EventsConfig,
    pub sockd: SockdConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            data_dir: PathBuf::from("/var/lib/spacegrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Reconciliation tick.
    pub reload_interval_ms: u64,
    /// Buffer for per-package reload requests.
    pub package_queue: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            reload_interval_ms: 2000,
            package_queue: 64,
        }
    }
}

impl RoutingConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub event_queue: usize,
    pub target_queue: usize,
    /// How often delayed targets are checked for expiry.
    pub sweep_interval_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            event_queue: 13,
            target_queue: 27,
            sweep_interval_ms: 5000,
        }
    }
}

impl EventsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SockdConfig {
    /// Buffer of each room's broadcast/publish/direct channels.
    pub room_channel_capacity: usize,
    /// Per-session outbound buffer.
    pub session_buffer: usize,
    pub broadcast_wait_ms: u64,
    pub publish_wait_ms: u64,
    pub idle_room_ttl_secs: u64,
    pub evict_interval_secs: u64,
}

impl Default for SockdConfig {
    fn default() -> Self {
        Self {
            room_channel_capacity: 32,
            session_buffer: 64,
            broadcast_wait_ms: 1000,
            publish_wait_ms: 2000,
            idle_room_ttl_secs: 600,
            evict_interval_secs: 60,
        }
    }
}

impl SockdConfig {
    pub fn broadcast_wait(&self) -> Duration {
        Duration::from_millis(self.broadcast_wait_ms)
    }

    pub fn publish_wait(&self) -> Duration {
        Duration::from_millis(self.publish_wait_ms)
    }

    pub fn idle_room_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_room_ttl_secs)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Pre-shared bearer tokens mapped to the user id they authenticate.
    pub tokens: HashMap<String, i64>,
}

impl SpaceGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SpaceGridConfig::from_toml_str("").unwrap();
        assert_eq!(config.routing.reload_interval(), Duration::from_secs(2));
        assert_eq!(config.events.event_queue, 13);
        assert_eq!(config.events.target_queue, 27);
        assert_eq!(config.sockd.room_channel_capacity, 32);
        assert_eq!(config.sockd.broadcast_wait(), Duration::from_secs(1));
        assert_eq!(config.sockd.publish_wait(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:9000"

[sockd]
session_buffer = 8

[auth.tokens]
"dev-token" = 42
"#;
        let config = SpaceGridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.data_dir, PathBuf::from("/var/lib/spacegrid"));
        assert_eq!(config.sockd.session_buffer, 8);
        assert_eq!(config.sockd.publish_wait_ms, 2000);
        assert_eq!(config.auth.tokens.get("dev-token"), Some(&42));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spacegrid.toml");
        let mut config = SpaceGridConfig::default();
        config.routing.reload_interval_ms = 500;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SpaceGridConfig::from_file(&path).unwrap();
        assert_eq!(loaded.routing.reload_interval_ms, 500);
    }
}
