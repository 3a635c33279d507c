//! Configuration Model
//!
//! Serde-backed configuration for sessions and logger sinks. Durations are stored as
//! milliseconds; every field falls back to the defaults in `core::constants`.

use crate::core::constants::{
    DEFAULT_LOGGER_DELIMITER, DEFAULT_SMOOTHING_FACTOR, INIT_DELAY, MIN_WATCHDOG_TICK, RUN_TIMEOUT,
    START_TIMEOUT, WATCHDOG_TICK,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Thresholds of the session watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Grace period before the first sample must arrive.
    #[serde(with = "duration_ms")]
    pub start_timeout: Duration,
    /// Maximum silence once running.
    #[serde(with = "duration_ms")]
    pub run_timeout: Duration,
    /// Tick interval, finer than both timeouts.
    #[serde(with = "duration_ms")]
    pub tick: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            start_timeout: START_TIMEOUT,
            run_timeout: RUN_TIMEOUT,
            tick: WATCHDOG_TICK,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Position of the measurement characteristic in the enumeration order.
    pub characteristic_index: usize,
    #[serde(with = "duration_ms")]
    pub init_delay: Duration,
    pub smoothing_factor: usize,
    pub watchdog: WatchdogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            characteristic_index: 0,
            init_delay: INIT_DELAY,
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Clamps values a session cannot run with: a zero smoothing factor becomes 1 and
    /// the watchdog tick is at least `MIN_WATCHDOG_TICK`.
    pub fn normalized(mut self) -> Self {
        self.smoothing_factor = self.smoothing_factor.max(1);
        self.watchdog.tick = self.watchdog.tick.max(MIN_WATCHDOG_TICK);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpLoggerConfig {
    pub destination: SocketAddr,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvLoggerConfig {
    pub path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    DEFAULT_LOGGER_DELIMITER.to_owned()
}

/// Complete configuration file of the `hrp-monitor` binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub session: SessionConfig,
    pub udp_logger: Option<UdpLoggerConfig>,
    pub csv_logger: Option<CsvLoggerConfig>,
}

impl MonitorConfig {
    /// Loads the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Stores the configuration to a JSON file.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
