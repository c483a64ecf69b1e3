//! Error types for the scan engine.
//!
//! This module defines the primary error type, `ScanError`, shared by every crate
//! in the workspace. Using the `thiserror` crate, it provides a centralized and
//! consistent way to describe what went wrong during scan configuration or while a
//! scan is stepping through its points.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates the following categories:
//!
//! - **Connection**: `ChannelNotConnected`, `ConnectionLost`. A channel that has not
//!   yet connected before a scan starts is a retried condition (the scan waits in
//!   its pending state), while losing a channel mid-scan aborts the scan.
//! - **Motion safety**: `LimitViolation`, `ReadbackDeviation`. Both abort the scan
//!   before it can acquire data at the wrong place.
//! - **Degraded operation**: `Busy`, `TableUnderrun`. Reported as diagnostics only.
//! - **Time**: `Timeout`. A completion deadline expired; the scan is aborted.
//! - **Parameter resolution**: `CapacityExceeded`, `TooConstrained`, `TableMode`.
//! - **Request state**: `AlreadyScanning`, `Paused`, `NotIdle`, `InvalidSlot`.
//! - **Infrastructure**: `Configuration`, `Driver`, `Io`.
//!
//! Every variant renders a human-readable message suitable for the status
//! surface's diagnostic text.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Classification of a failure reported by a channel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The endpoint is unreachable or the link dropped.
    Communication,
    /// The endpoint did not answer in time.
    Timeout,
    /// The device reported a fault.
    Hardware,
    /// The value or request was rejected.
    InvalidParameter,
    /// The endpoint is still processing a previous request.
    Busy,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by a [`ChannelHandle`](crate::channel::ChannelHandle) operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver or channel identifier that produced the error.
    pub driver_type: String,
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Free-form detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a communication failure on `channel`.
    pub fn not_connected(channel: impl Into<String>) -> Self {
        Self::new(channel, DriverErrorKind::Communication, "not connected")
    }
}

// =============================================================================
// Scan Errors
// =============================================================================

/// Which side of a positioner's operating range was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSide {
    /// Value fell below the low limit.
    Low,
    /// Value rose above the high limit.
    High,
}

/// How a readback tolerance was expressed when it was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceKind {
    /// Absolute distance from the commanded value.
    Delta,
    /// Multiple of the step increment.
    StepSize,
}

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for scan configuration and execution.
///
/// Positioner indices in messages are one-based (`P1`..`P4`) to match what an
/// operator sees; the fields themselves are zero-based slot indices.
///
/// # Error Categories
///
/// 1. **Fatal to the running scan** - `ConnectionLost`, `LimitViolation`,
///    `ReadbackDeviation`, `Timeout`
///    - Recovery: the scan is ended through its abort path, buffers are packed
///      with whatever was acquired, and the engine returns to idle.
///
/// 2. **Diagnostics** - `Busy`, `TableUnderrun`, `CapacityExceeded`, `TooConstrained`,
///    `TableMode`
///    - The request proceeds (or is left unchanged) and the alert flag is raised.
///
/// 3. **Rejected requests** - `AlreadyScanning`, `Paused`, `NotIdle`, `InvalidSlot`
///    - Nothing changed; retry after the engine state changes.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Semantic configuration error.
    ///
    /// **Error Type**: Permanent - requires fixing the configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required channel has not connected yet.
    ///
    /// **Error Type**: Transient - a scan start waits in its pending state.
    #[error("Channel '{channel}' is not connected")]
    ChannelNotConnected {
        /// Channel name.
        channel: String,
    },

    /// A required channel disconnected while a scan was running.
    ///
    /// **Error Type**: Fatal to the current scan.
    #[error("Lost connection to {channel}")]
    ConnectionLost {
        /// Channel name.
        channel: String,
    },

    /// A planned position lies outside the positioner's operating range.
    ///
    /// **Error Type**: Fatal to the step that would cause it; no write is issued.
    #[error("P{} Value {} {}_Limit @ point {point}", .positioner + 1, side_symbol(.side), side_label(.side))]
    LimitViolation {
        /// Zero-based positioner slot.
        positioner: usize,
        /// Zero-based point index.
        point: usize,
        /// Offending value.
        value: f64,
        /// Limit that was crossed.
        limit: f64,
        /// Which limit.
        side: LimitSide,
    },

    /// The positioner ended too far from where it was commanded.
    ///
    /// **Error Type**: Fatal to the scan.
    #[error("SCAN Aborted: P{} Error > {}", .positioner + 1, tolerance_label(.kind))]
    ReadbackDeviation {
        /// Zero-based positioner slot.
        positioner: usize,
        /// Commanded position.
        commanded: f64,
        /// Observed readback.
        readback: f64,
        /// How the tolerance was expressed.
        kind: ToleranceKind,
    },

    /// A completion reported that its endpoint was already busy.
    ///
    /// **Error Type**: Diagnostic - the operation counts as complete and the scan is
    /// flagged as degraded.
    #[error("{what} is already busy")]
    Busy {
        /// Human-readable description of the endpoint ("Positioner 1", "Detector 2").
        what: String,
    },

    /// The completion deadline expired with operations still outstanding.
    ///
    /// **Error Type**: Fatal to the scan.
    #[error("Timeout waiting for {outstanding} completion(s) during {phase}")]
    Timeout {
        /// Phase that was waiting.
        phase: String,
        /// How many completions never arrived.
        outstanding: usize,
    },

    /// Fewer table points are loaded than the scan will step through.
    ///
    /// **Error Type**: Diagnostic - the last table value is replayed.
    #[error("Pts in P{} Table < # of Steps ({loaded} < {requested})", .positioner + 1)]
    TableUnderrun {
        /// Zero-based positioner slot.
        positioner: usize,
        /// Loaded table length.
        loaded: usize,
        /// Requested point count.
        requested: usize,
    },

    /// The requested point count exceeds the buffer capacity.
    ///
    /// **Error Type**: Diagnostic - the count is clamped at configuration time.
    #[error("Request Exceeded Maximum Points ({requested} > {capacity})")]
    CapacityExceeded {
        /// Requested point count.
        requested: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// The freeze flags leave no field free to absorb a change.
    #[error("P{} SCAN Parameters Too Constrained !", .positioner + 1)]
    TooConstrained {
        /// Zero-based positioner slot.
        positioner: usize,
    },

    /// A linear field was written on a positioner that follows a table.
    #[error("Positioner #{} is in Table Mode !", .positioner + 1)]
    TableMode {
        /// Zero-based positioner slot.
        positioner: usize,
    },

    /// A start was requested while a scan is already running.
    #[error("Already scanning")]
    AlreadyScanning,

    /// A start was requested while paused.
    #[error("Scan is paused")]
    Paused,

    /// The request is only valid while the scan is idle.
    #[error("Scan is not idle")]
    NotIdle,

    /// A slot index is outside the configured slot range.
    #[error("Invalid {kind} slot {index}")]
    InvalidSlot {
        /// Slot kind ("positioner", "detector", "trigger").
        kind: &'static str,
        /// Offending index.
        index: usize,
    },

    /// Error bubbled up from a channel driver.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// I/O error, typically while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn side_symbol(side: &LimitSide) -> &'static str {
    match side {
        LimitSide::Low => "<",
        LimitSide::High => ">",
    }
}

fn side_label(side: &LimitSide) -> &'static str {
    match side {
        LimitSide::Low => "LO",
        LimitSide::High => "HI",
    }
}

fn tolerance_label(kind: &ToleranceKind) -> &'static str {
    match kind {
        ToleranceKind::Delta => "delta",
        ToleranceKind::StepSize => "stepsize",
    }
}

impl ScanError {
    /// Whether this error ends an in-progress scan through the abort path.
    ///
    /// Kill is never triggered by an error; it is operator-initiated only.
    pub fn aborts_scan(&self) -> bool {
        matches!(
            self,
            ScanError::ConnectionLost { .. }
                | ScanError::LimitViolation { .. }
                | ScanError::ReadbackDeviation { .. }
                | ScanError::Timeout { .. }
        )
    }
}
