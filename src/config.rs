//! Configuration for the haven HA manager.

use crate::error::{HavenError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port published in the registry when the node address omits one.
pub const DEFAULT_NODE_PORT: u16 = 10051;

/// Default failover delay in seconds.
pub const DEFAULT_FAILOVER_DELAY: i64 = 60;

/// Settings for one HA node, provided by the embedding server at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaSettings {
    /// Cluster node name; empty means standalone mode.
    pub node_name: String,
    /// External endpoint `host[:port]` published in the registry.
    pub node_address: String,
    /// Well-known unix socket path for the manager's IPC service.
    pub socket_path: PathBuf,
    /// Registry poll period (the tick).
    #[serde(with = "duration_serde")]
    pub poll_period: Duration,
    /// Heartbeat cadence toward the parent; also the loop's base tick.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,
    /// Bound on every IPC send/recv.
    #[serde(with = "duration_serde")]
    pub service_timeout: Duration,
    /// Initial log level.
    pub log_level: String,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_address: "localhost".to_string(),
            socket_path: PathBuf::from("/tmp/haven/ha.sock"),
            poll_period: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            service_timeout: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl HaSettings {
    /// Load settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HavenError::InvalidConfig {
            field: "file".to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;

        let settings: Self = serde_json::from_str(&content).map_err(|e| HavenError::InvalidConfig {
            field: "file".to_string(),
            reason: format!("cannot parse {}: {}", path.display(), e),
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.poll_period.is_zero() {
            return Err(HavenError::InvalidConfig {
                field: "poll_period".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.heartbeat_interval.is_zero() || self.heartbeat_interval > self.poll_period {
            return Err(HavenError::InvalidConfig {
                field: "heartbeat_interval".to_string(),
                reason: "must be non-zero and no longer than poll_period".to_string(),
            });
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(HavenError::InvalidConfig {
                field: "socket_path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        parse_node_address(&self.node_address)?;

        Ok(())
    }

    /// Whether this node is configured as a cluster member.
    pub fn is_cluster(&self) -> bool {
        !self.node_name.is_empty()
    }

    /// The external endpoint published in the registry.
    pub fn external_address(&self) -> Result<(String, u16)> {
        parse_node_address(&self.node_address)
    }
}

/// Parse a `host[:port]` endpoint, defaulting the port to
/// [`DEFAULT_NODE_PORT`]. An empty string resolves to `localhost`.
pub fn parse_node_address(input: &str) -> Result<(String, u16)> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(("localhost".to_string(), DEFAULT_NODE_PORT));
    }

    match input.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(HavenError::InvalidConfig {
                    field: "node_address".to_string(),
                    reason: format!("missing host in \"{}\"", input),
                });
            }
            let port = port.parse::<u16>().map_err(|_| HavenError::InvalidConfig {
                field: "node_address".to_string(),
                reason: format!("invalid port in \"{}\"", input),
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((input.to_string(), DEFAULT_NODE_PORT)),
    }
}

/// Serde helper for Duration fields using humantime-style suffixes.
pub mod duration_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
