use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::bridge::BridgeBaud;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Controller resets when the port opens; it is deaf for this long.
pub const SETTLE_DELAY_RANGE_MS: (u64, u64) = (2000, 2500);
pub const LINE_DEADLINE_RANGE_MS: (u64, u64) = (100, 200);

/// Complete link configuration. Every section falls back to its defaults
/// when omitted from the JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    pub serial: SerialSettings,
    pub usb: UsbSettings,
    pub framing: FramingSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub settle_delay_ms: u64,
    pub chunk_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            settle_delay_ms: 2000,
            chunk_timeout_ms: 20,
            write_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    pub baud: BridgeBaud,
    pub interface: u8,
    pub control_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            baud: BridgeBaud::B115200,
            interface: 0,
            control_timeout_ms: 1000,
            write_timeout_ms: 100,
            read_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    pub line_deadline_ms: u64,
    pub max_line_bytes: usize,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            line_deadline_ms: 100,
            max_line_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub repeat_period_ms: u64,
    pub message_capacity: usize,
    pub intent_capacity: usize,
    pub event_capacity: usize,
    pub max_consecutive_read_errors: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            repeat_period_ms: 150,
            message_capacity: 64,
            intent_capacity: 32,
            event_capacity: 64,
            max_consecutive_read_errors: 5,
        }
    }
}

impl LinkConfig {
    /// Profile matching the 115200 baud bridge firmware.
    pub fn ch340_115200() -> Self {
        let mut config = Self::default();
        config.usb.baud = BridgeBaud::B115200;
        config.usb.write_timeout_ms = 100;
        config.framing.line_deadline_ms = 100;
        config
    }

    /// Profile matching the older 9600 baud bridge firmware.
    pub fn ch340_9600() -> Self {
        let mut config = Self::default();
        config.usb.baud = BridgeBaud::B9600;
        config.usb.write_timeout_ms = 500;
        config.framing.line_deadline_ms = 200;
        config.serial.settle_delay_ms = 2500;
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded link configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = SETTLE_DELAY_RANGE_MS;
        if !(lo..=hi).contains(&self.serial.settle_delay_ms) {
            return Err(ConfigError::Invalid(format!(
                "serial.settle_delay_ms must be within {}..={} (got {})",
                lo, hi, self.serial.settle_delay_ms
            )));
        }
        let (lo, hi) = LINE_DEADLINE_RANGE_MS;
        if !(lo..=hi).contains(&self.framing.line_deadline_ms) {
            return Err(ConfigError::Invalid(format!(
                "framing.line_deadline_ms must be within {}..={} (got {})",
                lo, hi, self.framing.line_deadline_ms
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be non-zero".into()));
        }
        if self.serial.chunk_timeout_ms == 0 || self.usb.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("chunk read timeouts must be non-zero".into()));
        }
        if self.session.repeat_period_ms == 0 {
            return Err(ConfigError::Invalid("session.repeat_period_ms must be non-zero".into()));
        }
        if self.session.message_capacity == 0
            || self.session.intent_capacity == 0
            || self.session.event_capacity == 0
        {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        if self.framing.max_line_bytes == 0 {
            return Err(ConfigError::Invalid("framing.max_line_bytes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.serial.settle_delay_ms)
    }

    pub fn line_deadline(&self) -> Duration {
        Duration::from_millis(self.framing.line_deadline_ms)
    }

    pub fn repeat_period(&self) -> Duration {
        Duration::from_millis(self.session.repeat_period_ms)
    }

    /// Short poll used by the reader thread; bounds shutdown latency.
    pub fn chunk_timeout(&self, kind: crate::transport::TransportKind) -> Duration {
        match kind {
            crate::transport::TransportKind::Serial => Duration::from_millis(self.serial.chunk_timeout_ms),
            crate::transport::TransportKind::Usb => Duration::from_millis(self.usb.read_timeout_ms),
        }
    }
}
