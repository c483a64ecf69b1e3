//! Operator control surface.
//!
//! Start, pause, abort and kill are the four requests an operator (or an
//! enclosing scan) can make. They never block: each takes the scan lock,
//! records the request, advances the automaton as far as it can without
//! waiting, and returns.
//!
//! | Request | Effect |
//! |---------|--------|
//! | start   | Begin a pass, or wait in `ScanPending` until channels connect |
//! | pause   | Hold at the next re-entry; resume after the resume delay |
//! | abort   | Stop after outstanding completions drain, then retrace and run the after-scan hook |
//! | kill    | Drop everything in flight and return to idle immediately |
//!
//! A second abort while the first is still draining escalates to kill.

use crate::scan::Scan;
use daq_core::error::ScanResult;
use tracing::instrument;

/// Requests accepted by a running scan.
pub trait ScanControl: Send + Sync {
    /// Start a pass.
    ///
    /// # Errors
    ///
    /// `ScanError::Paused` while paused, `ScanError::AlreadyScanning` while a
    /// pass is executing or still finishing.
    fn request_start(&self) -> ScanResult<()>;

    /// Assert (`true`) or rescind (`false`) pause.
    fn request_pause(&self, paused: bool);

    /// Graceful abort.
    fn request_abort(&self);

    /// Immediate stop, discarding outstanding completions.
    fn request_kill(&self);
}

impl ScanControl for Scan {
    #[instrument(skip(self), fields(scan = %self.name()))]
    fn request_start(&self) -> ScanResult<()> {
        self.core.request_start()
    }

    #[instrument(skip(self), fields(scan = %self.name()))]
    fn request_pause(&self, paused: bool) {
        self.core.request_pause(paused);
    }

    #[instrument(skip(self), fields(scan = %self.name()))]
    fn request_abort(&self) {
        self.core.request_abort();
    }

    #[instrument(skip(self), fields(scan = %self.name()))]
    fn request_kill(&self) {
        self.core.request_kill();
    }
}
