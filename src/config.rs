//! Engine defaults and queue configuration.
//!
//! The constants in this module are the values used when a [`QueueConfig`]
//! field is left at its default. Configuration can be built in code or
//! loaded from JSON.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::logger::RecordLevel;

/// Number of worker threads started by default.
pub const DEFAULT_MAX_THREADS: usize = 1;

/// Number of attempts a job gets unless the caller asks for more.
pub const DEFAULT_ATTEMPTS: usize = 1;

/// Size of the buffer tail, in bytes, that a monitor searches on append.
pub const DEFAULT_MONITOR_WINDOW: usize = 80;

/// Driver scores at or below this value are treated as "no match".
pub const DEFAULT_DRIVER_THRESHOLD: u8 = 0;

/// Minimum confidence for the guessed OS to override banner ranking.
pub const DEFAULT_OS_CONFIDENCE: u8 = 50;

/// Confidence of the initial "unknown" OS guess.
pub const CONFIDENCE_UNKNOWN: u8 = 0;

/// Confidence of a weak protocol banner hint (e.g. a stock OpenSSH banner).
pub const CONFIDENCE_WEAK_BANNER: u8 = 20;

/// Confidence of a vendor-specific protocol banner.
pub const CONFIDENCE_PROTOCOL_BANNER: u8 = 80;

/// Name of the driver used when nothing else matches.
pub const GENERIC_DRIVER: &str = "generic";

/// Configuration for a [`Queue`](crate::queue::Queue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent worker threads (and thus device sessions).
    pub max_threads: usize,

    /// Optional upper bound on queued jobs. Enqueueing blocks while full.
    pub max_queue_size: Option<usize>,

    /// Attempts per job when the caller does not specify any.
    pub default_attempts: usize,

    /// Tail window searched by session monitors.
    pub monitor_window: usize,

    /// Minimum driver score for banner-based selection.
    pub driver_threshold: u8,

    /// Minimum confidence for trusting the OS guess when choosing a driver.
    pub os_confidence_threshold: u8,

    /// Per-job event recording granularity.
    pub record_level: RecordLevel,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_queue_size: None,
            default_attempts: DEFAULT_ATTEMPTS,
            monitor_window: DEFAULT_MONITOR_WINDOW,
            driver_threshold: DEFAULT_DRIVER_THRESHOLD,
            os_confidence_threshold: DEFAULT_OS_CONFIDENCE,
            record_level: RecordLevel::Off,
        }
    }
}

impl QueueConfig {
    /// Sets the number of worker threads.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the pipeline bound.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Sets the default number of attempts per job.
    pub fn with_default_attempts(mut self, attempts: usize) -> Self {
        self.default_attempts = attempts;
        self
    }

    /// Sets the recording level of the job logger.
    pub fn with_record_level(mut self, level: RecordLevel) -> Self {
        self.record_level = level;
        self
    }

    /// Checks that the configuration can drive a queue.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.max_threads == 0 {
            return Err(FleetError::InvalidConfig(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.default_attempts == 0 {
            return Err(FleetError::InvalidConfig(
                "default_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(FleetError::InvalidConfig(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.monitor_window == 0 {
            return Err(FleetError::InvalidConfig(
                "monitor_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, FleetError> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as pretty JSON.
    pub fn to_json(&self) -> Result<String, FleetError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_threads, DEFAULT_MAX_THREADS);
        assert_eq!(config.monitor_window, DEFAULT_MONITOR_WINDOW);
        assert_eq!(config.max_queue_size, None);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = QueueConfig::from_json(r#"{"max_threads": 8}"#).expect("parse config");
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.default_attempts, DEFAULT_ATTEMPTS);
        assert_eq!(config.record_level, RecordLevel::Off);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = QueueConfig::from_json(r#"{"max_threads": 0}"#).expect_err("must fail");
        assert!(matches!(err, FleetError::InvalidConfig(_)));
    }

    #[test]
    fn zero_queue_bound_is_rejected() {
        let config = QueueConfig::default().with_max_queue_size(0);
        assert!(matches!(
            config.validate(),
            Err(FleetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_json_roundtrip_keeps_values() {
        let config = QueueConfig::default()
            .with_max_threads(4)
            .with_default_attempts(3)
            .with_record_level(RecordLevel::Full);
        let json = config.to_json().expect("encode");
        assert_eq!(QueueConfig::from_json(&json).expect("decode"), config);
    }
}
