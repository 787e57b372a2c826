//! Configuration for the Modbus bridge.

use fieldbridge_common::{LoggingConfig, RegisterKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Devices to bridge
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for a single Modbus TCP device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Poll interval in milliseconds for all ranges of this device
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whether configured addresses are one-based (first register is 1)
    #[serde(default = "default_one_based")]
    pub one_based: bool,

    /// Connection retry and keepalive policy
    #[serde(default)]
    pub connection: ConnectionPolicy,

    /// Holding register ranges to poll
    #[serde(default)]
    pub holding_registers: Vec<AddressRange>,

    /// Input register ranges to poll
    #[serde(default)]
    pub input_registers: Vec<AddressRange>,

    /// Coil ranges to poll
    #[serde(default)]
    pub coils: Vec<AddressRange>,

    /// Discrete input ranges to poll
    #[serde(default)]
    pub discrete_inputs: Vec<AddressRange>,
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_one_based() -> bool {
    true
}

impl DeviceConfig {
    /// Human-readable device label used in logs.
    pub fn label(&self) -> String {
        format!("{}:{} unit {}", self.host, self.port, self.unit_id)
    }

    /// All configured ranges, paired with their register kind.
    pub fn ranges(&self) -> Vec<(RegisterKind, AddressRange)> {
        let mut out = Vec::new();
        for (kind, ranges) in [
            (RegisterKind::Holding, &self.holding_registers),
            (RegisterKind::Input, &self.input_registers),
            (RegisterKind::Coil, &self.coils),
            (RegisterKind::Discrete, &self.discrete_inputs),
        ] {
            out.extend(ranges.iter().map(|r| (kind, *r)));
        }
        out
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Reconnect and TCP keepalive policy for one device connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// Delay before a reconnect attempt, in milliseconds
    #[serde(default = "default_retry_time_ms")]
    pub retry_time_ms: u64,

    /// Reconnect even after a clean close (not only after errors)
    #[serde(default = "default_retry_always")]
    pub retry_always: bool,

    /// Timeout for establishing the TCP connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle time before the first keepalive probe, in milliseconds
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_delay_ms: u64,

    /// Interval between keepalive probes, in milliseconds
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_interval_ms: u64,

    /// Number of unanswered probes before the OS drops the connection
    #[serde(default = "default_keep_alive_probes")]
    pub keep_alive_probes: u32,
}

fn default_retry_time_ms() -> u64 {
    1000
}

fn default_retry_always() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive_ms() -> u64 {
    1000
}

fn default_keep_alive_probes() -> u32 {
    1
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            retry_time_ms: default_retry_time_ms(),
            retry_always: default_retry_always(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_delay_ms: default_keep_alive_ms(),
            keep_alive_interval_ms: default_keep_alive_ms(),
            keep_alive_probes: default_keep_alive_probes(),
        }
    }
}

impl ConnectionPolicy {
    /// Reconnect delay. Fixed, not exponential: the same delay applies
    /// regardless of how many consecutive attempts failed.
    pub fn retry_time(&self) -> Duration {
        Duration::from_millis(self.retry_time_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keepalive delay, floored at 1000 ms.
    pub fn keep_alive_delay(&self) -> Duration {
        Duration::from_millis(self.keep_alive_delay_ms.max(1000))
    }

    /// Keepalive probe interval, floored at 1000 ms.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1000))
    }

    /// Keepalive probe count, at least 1.
    pub fn keep_alive_probes(&self) -> u32 {
        self.keep_alive_probes.max(1)
    }
}

/// An address range expressed as `address` or `address:count`.
///
/// Addresses are kept signed until one-based normalization so that invalid
/// negative addresses can be rejected with a useful error instead of
/// wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AddressRangeRepr")]
pub struct AddressRange {
    /// Configured starting address (possibly one-based)
    pub address: i32,

    /// Number of consecutive points (default: 1)
    pub count: u16,
}

/// Accepts both the string grammar (`"100"` / `"100:4"`) and the structured
/// form (`{ address: 100, count: 4 }`) in config files.
#[derive(Deserialize)]
#[serde(untagged)]
enum AddressRangeRepr {
    Text(String),
    Full {
        address: i32,
        #[serde(default = "default_count")]
        count: u16,
    },
}

fn default_count() -> u16 {
    1
}

impl TryFrom<AddressRangeRepr> for AddressRange {
    type Error = RangeParseError;

    fn try_from(repr: AddressRangeRepr) -> Result<Self, Self::Error> {
        match repr {
            AddressRangeRepr::Text(s) => s.parse(),
            AddressRangeRepr::Full { address, count } => Ok(AddressRange { address, count }),
        }
    }
}

/// Error parsing an `address[:count]` range expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Range is invalid, specify <address>:<count> or <address>: {0}")]
pub struct RangeParseError(String);

impl FromStr for AddressRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, count) = match s.split_once(':') {
            Some((addr, count)) => {
                let count: u16 = count
                    .trim()
                    .parse()
                    .map_err(|_| RangeParseError(format!("bad count '{}'", count)))?;
                (addr, count)
            }
            None => (s, 1),
        };
        let address: i32 = addr
            .trim()
            .parse()
            .map_err(|_| RangeParseError(format!("bad address '{}'", addr)))?;
        Ok(AddressRange { address, count })
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 1 {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{}:{}", self.address, self.count)
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        for device in &self.devices {
            if device.host.is_empty() {
                return Err(ConfigError::Validation(
                    "Device host cannot be empty".to_string(),
                ));
            }

            if device.unit_id == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': unit_id must be 1-247",
                    device.label()
                )));
            }

            if device.poll_interval_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': poll_interval_ms must be positive",
                    device.label()
                )));
            }

            for (kind, range) in device.ranges() {
                if range.count == 0 {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': {} range at {} has count 0",
                        device.label(),
                        kind,
                        range.address
                    )));
                }
            }
        }

        Ok(())
    }
}
