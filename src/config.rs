//! Station configuration
//!
//! Timeouts, queue bounds and channel plans for the protocol engine.
//! Intervals are stored in milliseconds and exposed as [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{Result, StationError};

/// Tunable parameters of the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Total scan budget across all supported channels, in milliseconds
    pub scan_timeout_ms: u64,
    /// Timeout for each authentication/association response, in milliseconds
    pub response_timeout_ms: u64,
    /// Timeout for the complete key exchange, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Bound on the queue of unclaimed management indications
    pub indication_queue_capacity: usize,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 2_200,
            response_timeout_ms: 1_000,
            handshake_timeout_ms: 2_000,
            indication_queue_capacity: 16,
        }
    }
}

impl StationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scan_timeout_ms == 0 {
            return Err(StationError::Config("scan timeout must be non-zero".to_string()));
        }
        if self.response_timeout_ms == 0 {
            return Err(StationError::Config(
                "response timeout must be non-zero".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(StationError::Config(
                "handshake timeout must be non-zero".to_string(),
            ));
        }
        if self.indication_queue_capacity == 0 {
            return Err(StationError::Config(
                "indication queue capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Probe dwell per channel: the scan budget split across the channel plan
    pub fn probe_dwell(&self, channel_count: usize) -> Duration {
        let channels = channel_count.max(1) as u64;
        Duration::from_millis((self.scan_timeout_ms / channels).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_timeout(), Duration::from_millis(2_200));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = StationConfig { response_timeout_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_dwell_splits_budget() {
        let config = StationConfig { scan_timeout_ms: 1_100, ..Default::default() };
        assert_eq!(config.probe_dwell(11), Duration::from_millis(100));
        // A degenerate empty channel plan still yields a positive dwell.
        assert_eq!(config.probe_dwell(0), Duration::from_millis(1_100));
    }

    #[test]
    fn test_config_round_trip() {
        let config = StationConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scan_timeout_ms, config.scan_timeout_ms);
    }
}
