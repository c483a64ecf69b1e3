//! Shared hard limits for scan configuration.
//!
//! This module centralizes:
//! - Slot counts (positioners, triggers, detectors)
//! - Buffer capacity bounds
//! - Default completion deadlines and numeric tolerances
//!
//! Using centralized constants keeps the configuration validator, the
//! parameter resolver and the engine in agreement.

use crate::error::ScanError;
use std::time::Duration;

// =============================================================================
// Slot Counts
// =============================================================================

/// Number of positioner slots per scan.
pub const MAX_POSITIONERS: usize = 4;

/// Number of detector-trigger slots per scan.
pub const MAX_TRIGGERS: usize = 4;

/// Number of detector slots per scan.
pub const MAX_DETECTORS: usize = 70;

// =============================================================================
// Buffer Capacity
// =============================================================================

/// Default number of points per scan buffer.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Largest buffer capacity a scan may be configured with.
///
/// Each positioner and detector holds two buffers of this length, so the
/// bound keeps a fully populated scan well under a gigabyte.
pub const MAX_CAPACITY: usize = 1_000_000;

// =============================================================================
// Timing
// =============================================================================

/// Default deadline for one phase's outstanding completions.
///
/// `None` in configuration disables the deadline; this value is used by the
/// command-line front end when none is given.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settling delays shorter than this are treated as zero.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

// =============================================================================
// Numeric Tolerances
// =============================================================================

/// Increments with magnitude at or below this are treated as zero when deriving
/// a point count.
pub const INCREMENT_EPSILON: f64 = 1.0e-20;

/// Smallest position difference used as a slope denominator during edge search.
pub const SLOPE_DENOMINATOR_FLOOR: f64 = 1.0e-6;

/// Validate a requested buffer capacity.
///
/// # Errors
///
/// Returns `ScanError::Configuration` when the capacity is zero or above
/// [`MAX_CAPACITY`].
pub fn validate_capacity(capacity: usize) -> Result<usize, ScanError> {
    if capacity == 0 {
        return Err(ScanError::Configuration(
            "buffer capacity must be at least 1 point".into(),
        ));
    }
    if capacity > MAX_CAPACITY {
        return Err(ScanError::Configuration(format!(
            "buffer capacity {} exceeds limit {}",
            capacity, MAX_CAPACITY
        )));
    }
    Ok(capacity)
}

/// Clamp a requested point count into `[1, capacity]`.
///
/// Returns the clamped count and, when the request exceeded the capacity, the
/// diagnostic describing the clamp.
pub fn clamp_points(requested: usize, capacity: usize) -> (usize, Option<ScanError>) {
    if requested > capacity {
        (
            capacity,
            Some(ScanError::CapacityExceeded {
                requested,
                capacity,
            }),
        )
    } else {
        (requested.max(1), None)
    }
}
