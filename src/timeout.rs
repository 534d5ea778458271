//! Timeouts for the blocking calls of the submission pipeline
//!
//! Three calls may block on the network:
//! - `directory_lookup_seconds`: identity directory query
//! - `fetch_seconds`: one download attempt of the environment archive
//! - `submit_seconds`: the launch call, until the resource manager accepts
//!
//! Every bound is enforced by the component making the call. No call is
//! allowed to wait indefinitely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Identity directory query (default: 10)
    pub directory_lookup_seconds: u64,

    /// One archive download attempt (default: 600)
    pub fetch_seconds: u64,

    /// Launch call (default: 300)
    pub submit_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            directory_lookup_seconds: 10,
            fetch_seconds: 600,
            submit_seconds: 300,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // directory_lookup_seconds must be in (0, 120]
        if self.directory_lookup_seconds == 0 || self.directory_lookup_seconds > 120 {
            return Err(TimeoutValidationError::DirectoryOutOfBounds {
                value: self.directory_lookup_seconds,
            });
        }

        // fetch_seconds must be in (0, 7200]
        if self.fetch_seconds == 0 || self.fetch_seconds > 7200 {
            return Err(TimeoutValidationError::FetchOutOfBounds {
                value: self.fetch_seconds,
            });
        }

        // submit_seconds must be in (0, 3600]
        if self.submit_seconds == 0 || self.submit_seconds > 3600 {
            return Err(TimeoutValidationError::SubmitOutOfBounds {
                value: self.submit_seconds,
            });
        }

        Ok(())
    }

    pub fn directory_lookup(&self) -> Duration {
        Duration::from_secs(self.directory_lookup_seconds)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_seconds)
    }

    pub fn submit(&self) -> Duration {
        Duration::from_secs(self.submit_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("timeouts.directory_lookup_seconds must be in (0, 120], got {value}")]
    DirectoryOutOfBounds { value: u64 },

    #[error("timeouts.fetch_seconds must be in (0, 7200], got {value}")]
    FetchOutOfBounds { value: u64 },

    #[error("timeouts.submit_seconds must be in (0, 3600], got {value}")]
    SubmitOutOfBounds { value: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TimeoutConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_rejected() {
        let config = TimeoutConfig {
            directory_lookup_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimeoutValidationError::DirectoryOutOfBounds { value: 0 })
        ));
    }

    #[test]
    fn test_submit_upper_bound() {
        let config = TimeoutConfig {
            submit_seconds: 3601,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("submit_seconds"));
    }

    #[test]
    fn test_durations() {
        let config = TimeoutConfig::default();
        assert_eq!(config.directory_lookup(), Duration::from_secs(10));
        assert_eq!(config.submit(), Duration::from_secs(300));
    }
}
