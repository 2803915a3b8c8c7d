// Timeouts, clock rates, topics and the runtime configuration file
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Motor interrupt rates
pub const INTERRUPTS_PER_SEC: u32 = 100_000;
pub const TIP_INTERRUPTS_PER_SEC: u32 = 100_000;
pub const BRUSHED_MOTOR_INTERRUPTS_PER_SEC: u32 = 32_000;

// Bus send policy
pub const DEFAULT_SEND_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

// Acknowledgement waits
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const MIN_ACK_TIMEOUT: Duration = Duration::from_secs(1);

// Move group deadlines: max(MIN_GROUP_TIMEOUT, duration * GROUP_TIMEOUT_FACTOR)
pub const MIN_GROUP_TIMEOUT: Duration = Duration::from_secs(1);
pub const GROUP_TIMEOUT_FACTOR: f64 = 2.0;
// Groups running longer than duration * EXPECTED_TIME_FACTOR are logged
pub const EXPECTED_TIME_FACTOR: f64 = 1.1;

// Tip presence flicker window
pub const TIP_DEBOUNCE: Duration = Duration::from_millis(500);

// Zenoh topics
pub const TOPIC_BUS_TX: &str = "gantry/bus/tx"; // host -> nodes
pub const TOPIC_BUS_RX: &str = "gantry/bus/rx"; // nodes -> host

// Serial bus adapter
pub const SERIAL_PORT: &str = "/dev/ttyACM0";
pub const SERIAL_BAUDRATE: u32 = 1_000_000;
pub const SERIAL_TIMEOUT_MS: u64 = 100;

/// Error types for loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which bus the runtime talks to
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process simulated nodes
    #[default]
    Loopback,
    Serial {
        #[serde(default = "default_serial_port")]
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
    },
    Zenoh {
        #[serde(default = "default_tx_key")]
        tx_key: String,
        #[serde(default = "default_rx_key")]
        rx_key: String,
    },
}

fn default_serial_port() -> String {
    SERIAL_PORT.to_string()
}

fn default_baudrate() -> u32 {
    SERIAL_BAUDRATE
}

fn default_tx_key() -> String {
    TOPIC_BUS_TX.to_string()
}

fn default_rx_key() -> String {
    TOPIC_BUS_RX.to_string()
}

/// Runtime settings; every field falls back to the constants above
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub send_retries: u32,
    pub retry_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub min_group_timeout_ms: u64,
    pub group_timeout_factor: f64,
    pub tip_debounce_ms: u64,
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_retries: DEFAULT_SEND_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            ack_timeout_ms: ACK_TIMEOUT.as_millis() as u64,
            min_group_timeout_ms: MIN_GROUP_TIMEOUT.as_millis() as u64,
            group_timeout_factor: GROUP_TIMEOUT_FACTOR,
            tip_debounce_ms: TIP_DEBOUNCE.as_millis() as u64,
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn min_group_timeout(&self) -> Duration {
        Duration::from_millis(self.min_group_timeout_ms)
    }

    pub fn tip_debounce(&self) -> Duration {
        Duration::from_millis(self.tip_debounce_ms)
    }
}
