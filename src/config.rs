use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub application: ApplicationConfig,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// How long an outbound request waits for its correlated response.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Send `session` + `register_capabilities` every time the connection comes up.
    #[serde(default = "default_true")]
    pub announce_on_connect: bool,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Identity stamped into every execution context when the caller does not provide one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    #[serde(default = "default_application_id")]
    pub id: String,
    #[serde(default = "default_application_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            id: default_application_id(),
            name: default_application_name(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// `None` retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: Option<u32>,

    #[serde(default = "default_reconnect_base_delay", with = "duration_ms")]
    pub reconnect_base_delay: Duration,

    #[serde(default = "default_reconnect_max_delay", with = "duration_ms")]
    pub reconnect_max_delay: Duration,

    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    #[serde(default = "default_ping_interval", with = "duration_ms")]
    pub ping_interval: Duration,

    #[serde(default = "default_pong_timeout", with = "duration_ms")]
    pub pong_timeout: Duration,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: default_true(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay: default_reconnect_base_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
            connect_timeout: default_connect_timeout(),
            ping_interval: default_ping_interval(),
            pong_timeout: default_pong_timeout(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            event_buffer_size: default_event_buffer_size(),
            request_timeout: default_request_timeout(),
            announce_on_connect: default_true(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        from_file(path)
    }

    pub fn from_str(s: &str) -> BridgeResult<Self> {
        from_str(s)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> BridgeResult<T> {
    let file = File::open(path)
        .map_err(|e| BridgeError::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| BridgeError::Config(format!("Failed to parse config file: {}", e)))
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> BridgeResult<T> {
    serde_json::from_str(s)
        .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))
}

fn default_event_buffer_size() -> usize {
    1000
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_application_id() -> String {
    "application".to_string()
}
fn default_application_name() -> String {
    "AgentBridge Application".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_max_reconnect_attempts() -> Option<u32> {
    Some(10)
}
fn default_reconnect_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_pong_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_queue_size() -> usize {
    1000
}

// Durations travel as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
