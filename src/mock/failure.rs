//! Failure injection for the in-process mocks
//!
//! Each external call (directory lookup, archive fetch, launch) can be made
//! to fail, optionally only for the first N calls, and to stall before
//! answering.

use std::collections::HashMap;
use std::time::Duration;

/// External call a failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Lookup,
    Fetch,
    Launch,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error kind, interpreted by the mock (e.g. `REJECTED`, `AUTH`)
    pub error_code: Option<String>,
    /// Diagnostic text returned with the error
    pub error_message: Option<String>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// Create a config that returns an error
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            delay: None,
            fail_count: None,
        }
    }

    /// Create a config that just adds delay
    pub fn delay(duration: Duration) -> Self {
        Self {
            error_code: None,
            error_message: None,
            delay: Some(duration),
            fail_count: None,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    pub fn code(&self) -> &str {
        self.error_code.as_deref().unwrap_or("")
    }

    pub fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "injected failure".to_string())
    }
}

/// Failure injector shared by the mocks
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<Operation, FailureConfig>,
    call_counts: HashMap<Operation, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation
    pub fn inject(&mut self, op: Operation, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    /// Clear failure injection for an operation
    pub fn clear_op(&mut self, op: Operation) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Failure to apply to this call, if any
    ///
    /// Sleeps for the configured delay first. Delay-only configs never fail.
    pub fn check(&mut self, op: Operation) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?.clone();
        if let Some(delay) = config.delay {
            std::thread::sleep(delay);
        }
        config.error_code.as_ref()?;

        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;
        if let Some(limit) = config.fail_count {
            if *count > limit {
                return None;
            }
        }
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_failure_configured() {
        let mut injector = FailureInjector::new();
        assert!(injector.check(Operation::Lookup).is_none());
    }

    #[test]
    fn test_fail_count() {
        let mut injector = FailureInjector::new();
        injector.inject(
            Operation::Fetch,
            FailureConfig::error("HTTP_503", "unavailable").with_fail_count(2),
        );

        assert!(injector.check(Operation::Fetch).is_some());
        assert!(injector.check(Operation::Fetch).is_some());
        assert!(injector.check(Operation::Fetch).is_none());
        assert!(injector.check(Operation::Launch).is_none());
    }

    #[test]
    fn test_delay_only_never_fails() {
        let mut injector = FailureInjector::new();
        injector.inject(Operation::Launch, FailureConfig::delay(Duration::from_millis(1)));
        assert!(injector.check(Operation::Launch).is_none());
    }

    #[test]
    fn test_clear() {
        let mut injector = FailureInjector::new();
        injector.inject(Operation::Launch, FailureConfig::error("REJECTED", "queue full"));
        assert_eq!(injector.check(Operation::Launch).unwrap().code(), "REJECTED");

        injector.clear_op(Operation::Launch);
        assert!(injector.check(Operation::Launch).is_none());
    }
}
