//! AlarmSrv configuration
//!
//! Loaded from built-in defaults, then an optional YAML/TOML/JSON file, then
//! `ALARMSRV_*` environment variables (`ALARMSRV_MODEM__PORT=/dev/ttyUSB2`).

use crate::error::{AlarmError, Result};
use aqua_io::ModemConfig;
use common::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ALARMSRV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Device whose location goes into SMS bodies
    pub device_id: String,
    /// Product name used as the SMS title prefix
    pub product_name: String,
    pub database: DatabaseConfig,
    pub modem: ModemConfig,
    pub buzzer: BuzzerConfig,
    pub dispatch: DispatchConfig,
    pub lifecycle: LifecycleConfig,
    pub poll: PollConfig,
    pub logging: LogConfig,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            device_id: "dev-1".to_string(),
            product_name: "AquaWatch".to_string(),
            database: DatabaseConfig::default(),
            modem: ModemConfig::default(),
            buzzer: BuzzerConfig::default(),
            dispatch: DispatchConfig::default(),
            lifecycle: LifecycleConfig::default(),
            poll: PollConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file (created if missing)
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/aquawatch.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuzzerConfig {
    pub enabled: bool,
    /// BCM pin number
    pub gpio_pin: u32,
    pub gpio_base_path: String,
    /// Silence between pulses of a repeating pattern
    pub pause_secs: f64,
}

impl Default for BuzzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gpio_pin: 17,
            gpio_base_path: "/sys/class/gpio".to_string(),
            pause_secs: 1.0,
        }
    }
}

impl BuzzerConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_secs_f64(self.pause_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    /// Pause after each SMS
    pub send_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            send_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Minimum time between two initial notifications for the same rule
    pub throttle_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { throttle_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// How often the latest measurement is evaluated
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_secs: 1 }
    }
}

impl AlarmConfig {
    /// Load configuration from defaults, `path` (if it exists) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = common::load_layered(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.queue_capacity == 0 {
            return Err(AlarmError::Config(
                "dispatch.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.modem.port.trim().is_empty() {
            return Err(AlarmError::Config(
                "modem.port cannot be empty".to_string(),
            ));
        }
        if self.modem.baud_rate == 0 {
            return Err(AlarmError::Config(
                "modem.baud_rate must be greater than zero".to_string(),
            ));
        }
        if self.poll.interval_secs == 0 {
            return Err(AlarmError::Config(
                "poll.interval_secs must be greater than zero".to_string(),
            ));
        }
        if !self.buzzer.pause_secs.is_finite() || self.buzzer.pause_secs < 0.0 {
            return Err(AlarmError::Config(
                "buzzer.pause_secs must be a non-negative number".to_string(),
            ));
        }
        if self.database.path.trim().is_empty() {
            return Err(AlarmError::Config(
                "database.path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
