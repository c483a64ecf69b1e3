//! Operational modes for mock channels.
//!
//! - **Instant**: zero delays, deterministic behavior for unit tests
//! - **Realistic**: configured move and trigger times
//! - **Chaos**: realistic timing plus random injected failures

use serde::{Deserialize, Serialize};

/// Operational modes for mock channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    Instant,
    /// Hardware-like timing - for integration tests and demos
    Realistic,
    /// Configurable failures - for resilience testing
    Chaos,
}

impl Default for MockMode {
    fn default() -> Self {
        MockMode::Instant
    }
}

impl MockMode {
    /// Whether configured delays are honoured.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
