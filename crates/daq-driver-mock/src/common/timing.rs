//! Default completion times per channel kind.
//!
//! Used in realistic mode when a channel does not configure its own time.

use std::time::Duration;

/// Completion times for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Time a positioner takes to finish a move, in milliseconds
    pub move_time_ms: u64,
    /// Time a detector trigger takes to finish acquiring, in milliseconds
    pub trigger_time_ms: u64,
    /// Time a before/after-scan hook takes, in milliseconds
    pub hook_time_ms: u64,
    /// Communication delay added to every completion, in milliseconds
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Typical motor controller
    pub fn motor() -> Self {
        Self {
            move_time_ms: 50,
            trigger_time_ms: 0,
            hook_time_ms: 0,
            communication_delay_ms: 2,
        }
    }

    /// Typical counter/scaler gate
    pub fn detector() -> Self {
        Self {
            move_time_ms: 0,
            trigger_time_ms: 20,
            hook_time_ms: 0,
            communication_delay_ms: 1,
        }
    }

    fn total(&self, ms: u64) -> Duration {
        Duration::from_millis(ms + self.communication_delay_ms)
    }

    /// Move completion time.
    pub fn move_time(&self) -> Duration {
        self.total(self.move_time_ms)
    }

    /// Trigger completion time.
    pub fn trigger_time(&self) -> Duration {
        self.total(self.trigger_time_ms)
    }

    /// Hook completion time.
    pub fn hook_time(&self) -> Duration {
        self.total(self.hook_time_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            move_time_ms: 0,
            trigger_time_ms: 0,
            hook_time_ms: 0,
            communication_delay_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let config = TimingConfig::default();
        assert_eq!(config.move_time(), Duration::ZERO);
        assert_eq!(config.trigger_time(), Duration::ZERO);
    }

    #[test]
    fn test_motor_timing() {
        let config = TimingConfig::motor();
        assert_eq!(config.move_time(), Duration::from_millis(52));
        assert_eq!(config.hook_time(), Duration::from_millis(2));
    }

    #[test]
    fn test_detector_timing() {
        assert_eq!(TimingConfig::detector().trigger_time(), Duration::from_millis(21));
    }
}
