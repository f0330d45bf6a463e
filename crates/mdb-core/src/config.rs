//! Configuration structures, loadable from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which UART provider drives the MDB line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UartDriver {
    /// Direct serial tty with sticky parity.
    #[default]
    File,
    /// External helper program over stdin/stdout.
    Helper,
    /// SPI bridge microcontroller.
    Bridge,
}

/// Top level MDB configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdbConfig {
    pub uart_driver: UartDriver,
    /// Serial device path (file and helper drivers).
    pub uart_device: String,
    /// Helper program path (helper driver).
    pub helper_path: String,
    pub log_debug: bool,
    pub bridge: BridgeConfig,
    pub timings: DeviceTimings,
}

impl Default for MdbConfig {
    fn default() -> Self {
        Self {
            uart_driver: UartDriver::File,
            uart_device: "/dev/ttyAMA0".to_string(),
            helper_path: String::new(),
            log_debug: false,
            bridge: BridgeConfig::default(),
            timings: DeviceTimings::default(),
        }
    }
}

impl MdbConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MdbConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// SPI bridge link parameters and client retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub spi_device: String,
    pub spi_speed_hz: u32,
    /// GPIO chip carrying the notify line.
    pub notify_chip: String,
    pub notify_line: u32,
    /// Command write attempts while the bridge reports busy.
    pub busy_retries: u32,
    pub busy_delay_us: u64,
    /// Frame reads per transaction before giving up.
    pub read_retries: u32,
    pub handshake_tries: u32,
    pub default_timeout_ms: u64,
    /// Longest single wait of the notify listener, bounds close latency.
    pub notify_poll_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spi_device: "/dev/spidev0.0".to_string(),
            spi_speed_hz: 200_000,
            notify_chip: "/dev/gpiochip0".to_string(),
            notify_line: 25,
            busy_retries: 3,
            busy_delay_us: 500,
            read_retries: 13,
            handshake_tries: 5,
            default_timeout_ms: 20,
            notify_poll_ms: 500,
        }
    }
}

impl BridgeConfig {
    pub fn busy_delay(&self) -> Duration {
        Duration::from_micros(self.busy_delay_us)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn notify_poll(&self) -> Duration {
        Duration::from_millis(self.notify_poll_ms.max(1))
    }
}

/// Device timing knobs in milliseconds. Zero means "use default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTimings {
    pub after_reset_ms: u64,
    pub before_reset_ms: u64,
    pub idle_ms: u64,
    pub next_ms: u64,
    pub offline_ms: u64,
    pub idle_threshold_ms: u64,
}

pub const DEFAULT_DELAY_AFTER_RESET: Duration = Duration::from_millis(500);
pub const DEFAULT_DELAY_BEFORE_RESET: Duration = Duration::ZERO;
pub const DEFAULT_DELAY_IDLE: Duration = Duration::from_millis(700);
pub const DEFAULT_DELAY_NEXT: Duration = Duration::from_millis(200);
pub const DEFAULT_DELAY_OFFLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// Resolved device delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    pub after_reset: Duration,
    pub before_reset: Duration,
    pub idle: Duration,
    pub next: Duration,
    /// Minimum spacing between two resets.
    pub offline: Duration,
    pub idle_threshold: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        DeviceTimings::default().resolve()
    }
}

impl Delays {
    /// Same delay everywhere except the idle threshold. Handy in tests.
    pub fn uniform(d: Duration) -> Self {
        Self {
            after_reset: d,
            before_reset: d,
            idle: d,
            next: d,
            offline: d,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

impl DeviceTimings {
    pub fn resolve(&self) -> Delays {
        fn ms_or(ms: u64, default: Duration) -> Duration {
            if ms == 0 {
                default
            } else {
                Duration::from_millis(ms)
            }
        }
        Delays {
            after_reset: ms_or(self.after_reset_ms, DEFAULT_DELAY_AFTER_RESET),
            before_reset: ms_or(self.before_reset_ms, DEFAULT_DELAY_BEFORE_RESET),
            idle: ms_or(self.idle_ms, DEFAULT_DELAY_IDLE),
            next: ms_or(self.next_ms, DEFAULT_DELAY_NEXT),
            offline: ms_or(self.offline_ms, DEFAULT_DELAY_OFFLINE),
            idle_threshold: ms_or(self.idle_threshold_ms, DEFAULT_IDLE_THRESHOLD),
        }
    }
}
