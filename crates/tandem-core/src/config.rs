//! Tester configuration.
//!
//! Loaded from TOML. Every field has a default, unknown keys are ignored, and
//! the camelCase spellings used by older test scripts are accepted as
//! aliases:
//!
//! ```toml
//! check = true
//! debugLevel = 4
//! printReceivedPackets = false
//! syncPort = 3456
//! firewallControlBinary = "iptables"
//! retransmit_interval_ms = 100
//! max_retransmissions = 50
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Default UDP port of the sync side channel.
pub const DEFAULT_SYNC_PORT: u16 = 3456;

/// Default retransmission interval of sync announcements.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Highest meaningful debug level.
pub const MAX_DEBUG_LEVEL: u8 = 5;

/// Errors loading a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Contents are not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Options shared by every engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    /// Validate replies against the prior state
    pub check: bool,

    /// Verbosity 0 to 5, higher values are clamped
    #[serde(alias = "debugLevel")]
    pub debug_level: u8,

    /// Log every received packet at INFO
    #[serde(alias = "printReceivedPackets")]
    pub print_received_packets: bool,

    /// UDP port of the sync side channel
    #[serde(alias = "syncPort")]
    pub sync_port: u16,

    /// Binary toggling the kernel-bypass firewall rule
    #[serde(alias = "firewallControlBinary")]
    pub firewall_control_binary: String,

    /// Interval between sync retransmissions, in milliseconds
    #[serde(alias = "retransmitIntervalMs")]
    pub retransmit_interval_ms: u64,

    /// Give up announcing after this many transmissions, `None` never does
    #[serde(alias = "maxRetransmissions")]
    pub max_retransmissions: Option<u32>,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            check: false,
            debug_level: 0,
            print_received_packets: false,
            sync_port: DEFAULT_SYNC_PORT,
            firewall_control_binary: "iptables".to_string(),
            retransmit_interval_ms: DEFAULT_RETRANSMIT_INTERVAL.as_millis() as u64,
            max_retransmissions: None,
        }
    }
}

impl TesterConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or mistyped fields.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(input)?;
        config.debug_level = config.debug_level.min(MAX_DEBUG_LEVEL);
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`TesterConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml_str(&input)
    }

    /// Enables reply validation.
    #[must_use]
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Sets the debug level, clamped to [`MAX_DEBUG_LEVEL`].
    #[must_use]
    pub fn with_debug_level(mut self, level: u8) -> Self {
        self.debug_level = level.min(MAX_DEBUG_LEVEL);
        self
    }

    /// Tracing level filter for the debug level.
    ///
    /// | level | filter |
    /// |-------|--------|
    /// | 0     | WARN   |
    /// | 1     | INFO   |
    /// | 2, 3  | DEBUG  |
    /// | 4, 5  | TRACE  |
    pub fn log_level(&self) -> LevelFilter {
        match self.debug_level {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 | 3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Returns true if received packets are worth logging at this level.
    pub fn traces_packets(&self) -> bool {
        self.debug_level >= 4
    }

    /// Retransmission policy of the sync side channel.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retransmit_interval_ms),
            max_attempts: self.max_retransmissions,
        }
    }
}

/// How sync announcements are retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between transmissions
    pub interval: Duration,
    /// Give up after this many transmissions, `None` never does
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { interval: DEFAULT_RETRANSMIT_INTERVAL, max_attempts: None }
    }
}
