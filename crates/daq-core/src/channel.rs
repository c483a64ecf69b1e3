//! Channel handle contract.
//!
//! A scan never talks to hardware directly. Every positioner drive, positioner
//! readback, detector, detector trigger and before/after hook is reached through
//! a named, asynchronously resolvable endpoint: a [`ChannelHandle`]. The transport
//! behind it (network protocol, in-process simulation, another scan) is opaque.
//!
//! # Operations
//!
//! | Operation | Shape | Notes |
//! |---|---|---|
//! | connect | [`ChannelProvider::connect`] | returns at once; connectivity arrives on [`ChannelHandle::connection`] |
//! | get | [`ChannelHandle::get`] | cached, non-blocking, best effort |
//! | put | [`ChannelHandle::put`] | fire-and-forget |
//! | put with completion | [`ChannelHandle::put_with_completion`] | resolves exactly once, even on failure |
//! | monitor | [`ChannelHandle::monitor`] | latest value, change-notified |
//!
//! # Connection metadata
//!
//! When a channel connects it publishes [`ChannelMetadata`]: display range,
//! control (drive) range, precision, engineering units and element count. The
//! engine uses the control range as a positioner's operating limits and the
//! element count to decide whether a detector is array-valued.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = provider.connect("motor:x");
//! let mut state = handle.connection();
//! state.wait_for(|s| s.is_connected()).await?;
//!
//! match handle.put_with_completion(2.5).await {
//!     PutStatus::Done => {}
//!     other => tracing::warn!(?other, "move did not complete cleanly"),
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::DriverError;

// =============================================================================
// Metadata & State
// =============================================================================

/// Metadata published by a channel when it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Suggested display range `(low, high)`.
    pub display_range: Option<(f64, f64)>,
    /// Range the endpoint accepts for writes `(low, high)`.
    pub control_range: Option<(f64, f64)>,
    /// Display precision (digits after the decimal point).
    pub precision: u16,
    /// Engineering units.
    pub units: String,
    /// Number of elements; greater than one for array-valued channels.
    pub element_count: usize,
}

impl Default for ChannelMetadata {
    fn default() -> Self {
        Self {
            display_range: None,
            control_range: None,
            precision: 3,
            units: String::new(),
            element_count: 1,
        }
    }
}

/// Connectivity of one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Resolution is in progress.
    Connecting,
    /// Connected, with the metadata obtained at connect time.
    Connected(ChannelMetadata),
    /// The endpoint is unreachable.
    Disconnected,
}

impl ConnectionState {
    /// Whether the channel can currently be used.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Metadata, when connected.
    pub fn metadata(&self) -> Option<&ChannelMetadata> {
        match self {
            ConnectionState::Connected(meta) => Some(meta),
            _ => None,
        }
    }
}

/// Result delivered by [`ChannelHandle::put_with_completion`].
#[derive(Debug, Clone, PartialEq)]
pub enum PutStatus {
    /// The write was processed to completion.
    Done,
    /// The endpoint refused because a previous write is still in progress.
    Busy,
    /// The channel disconnected before the write completed.
    Disconnected,
    /// The endpoint gave up waiting.
    TimedOut,
    /// Any other failure.
    Failed(DriverError),
}

impl PutStatus {
    /// Whether the write completed normally.
    pub fn is_done(&self) -> bool {
        matches!(self, PutStatus::Done)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// A named endpoint that can be read, written and monitored.
///
/// Implementations must never call back into the caller from inside
/// [`put_with_completion`](ChannelHandle::put_with_completion) before the
/// returned future is polled; completion is delivered by the future itself.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel name as configured.
    fn name(&self) -> &str;

    /// Subscribe to connectivity changes. The current state is available
    /// immediately through `borrow()`.
    fn connection(&self) -> watch::Receiver<ConnectionState>;

    /// Whether the channel is connected right now.
    fn is_connected(&self) -> bool {
        self.connection().borrow().is_connected()
    }

    /// Metadata from the most recent connect, if connected.
    fn metadata(&self) -> Option<ChannelMetadata> {
        self.connection().borrow().metadata().cloned()
    }

    /// Latest scalar value, without blocking.
    fn get(&self) -> Result<f64, DriverError>;

    /// Latest array value, truncated to `max` elements.
    ///
    /// Scalar channels return a single-element array.
    fn get_array(&self, max: usize) -> Result<Vec<f64>, DriverError> {
        let value = self.get()?;
        Ok(if max == 0 { Vec::new() } else { vec![value] })
    }

    /// Write without waiting for completion.
    fn put(&self, value: f64) -> Result<(), DriverError>;

    /// Write and resolve once the endpoint has finished processing.
    ///
    /// The future resolves exactly once per call.
    async fn put_with_completion(&self, value: f64) -> PutStatus;

    /// Subscribe to value changes. `None` until a first value is known.
    fn monitor(&self) -> watch::Receiver<Option<f64>>;
}

/// Shared, type-erased channel handle.
pub type SharedChannel = Arc<dyn ChannelHandle>;

/// Resolves channel names to handles.
///
/// `connect` returns immediately; a name that cannot be resolved yields a
/// handle that stays in [`ConnectionState::Connecting`] or
/// [`ConnectionState::Disconnected`].
pub trait ChannelProvider: Send + Sync {
    /// Resolve `name` to a handle.
    fn connect(&self, name: &str) -> SharedChannel;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_metadata() {
        let meta = ChannelMetadata {
            control_range: Some((-5.0, 5.0)),
            units: "mm".into(),
            ..Default::default()
        };
        let state = ConnectionState::Connected(meta.clone());
        assert!(state.is_connected());
        assert_eq!(state.metadata(), Some(&meta));

        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Disconnected.metadata().is_none());
    }

    #[test]
    fn test_put_status() {
        assert!(PutStatus::Done.is_done());
        assert!(!PutStatus::Busy.is_done());
        assert!(!PutStatus::Failed(DriverError::not_connected("x")).is_done());
    }

    #[test]
    fn test_metadata_serializes() {
        let meta = ChannelMetadata::default();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"element_count\":1"));
    }
}
