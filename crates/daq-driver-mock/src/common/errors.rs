//! Error injection framework for mock channels.
//!
//! Enables configurable failures for resilience testing. Operations are named
//! `"get"`, `"put"` and `"complete"` (a write with completion). Failures on
//! `"complete"` are reported through the completion status rather than as an
//! error.

use super::rng::MockRng;
use daq_core::channel::PutStatus;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock channels
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0)
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail after N successful operations
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Timeout on specific operation
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// Endpoint reports it is still busy with a previous request
    Busy {
        /// Operation name
        operation: &'static str,
    },
    /// Simulate communication loss
    CommunicationLoss,
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Operation counters for FailAfterN scenarios
    operation_counts: HashMap<&'static str, u32>,
    /// Whether communication is lost
    communication_lost: bool,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// Create error config with uniform random failures and specific seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate); // Wildcard for all operations
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(Vec::new()),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            failure_rates: Arc::new(HashMap::new()),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(None)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::Busy { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Busy,
                        "previous request still in progress",
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }
        Ok(())
    }

    /// Completion status an injected failure of `"complete"` maps to, if any.
    pub fn completion_fault(&self, driver_type: &str) -> Option<PutStatus> {
        let err = self.check_operation(driver_type, "complete").err()?;
        Some(match err.kind {
            DriverErrorKind::Communication => PutStatus::Disconnected,
            DriverErrorKind::Timeout => PutStatus::TimedOut,
            DriverErrorKind::Busy => PutStatus::Busy,
            _ => PutStatus::Failed(err),
        })
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("m1", "get").is_ok());
        }
        assert!(config.completion_fault("m1").is_none());
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("m1", "get").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n_and_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "get",
            count: 2,
        });
        assert!(config.check_operation("m1", "get").is_ok());
        assert!(config.check_operation("m1", "get").is_ok());
        assert!(config.check_operation("m1", "get").is_err());
        assert!(config.check_operation("m1", "put").is_ok());

        config.reset();
        assert!(config.check_operation("m1", "get").is_ok());
    }

    #[test]
    fn test_completion_fault_mapping() {
        let busy = ErrorConfig::scenario(ErrorScenario::Busy {
            operation: "complete",
        });
        assert_eq!(busy.completion_fault("d1"), Some(PutStatus::Busy));

        let timeout = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "complete",
        });
        assert_eq!(timeout.completion_fault("d1"), Some(PutStatus::TimedOut));

        let lost = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert_eq!(lost.completion_fault("d1"), Some(PutStatus::Disconnected));
        // Stays lost for every operation.
        assert!(lost.check_operation("d1", "get").is_err());
    }
}
