//! Single-slot delay timer.
//!
//! Settling delays, the resume delay and completion deadlines are all
//! "re-enter the scan after some time". Each scan owns one [`DelayTimer`] per
//! purpose; scheduling replaces whatever was pending.
//!
//! The callback receives the [`TimerTicket`] it was scheduled with and must
//! claim it with [`DelayTimer::fire`] under the scan lock. A timer cancelled
//! after its sleep finished but before it got the lock fails the claim, so a
//! cancelled timer never re-enters the automaton.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Identifies one scheduling of a [`DelayTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTicket(u64);

#[derive(Debug)]
struct PendingTimer {
    ticket: TimerTicket,
    task: JoinHandle<()>,
}

/// Cancellable, single-slot scheduled callback.
#[derive(Debug, Default)]
pub struct DelayTimer {
    next: u64,
    pending: Option<PendingTimer>,
}

impl DelayTimer {
    /// Idle timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` after `delay` on `handle`, cancelling any pending run.
    pub fn schedule<F>(&mut self, handle: &Handle, delay: Duration, callback: F) -> TimerTicket
    where
        F: FnOnce(TimerTicket) + Send + 'static,
    {
        self.cancel();
        self.next += 1;
        let ticket = TimerTicket(self.next);
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback(ticket);
        });
        self.pending = Some(PendingTimer { ticket, task });
        ticket
    }

    /// Claim a firing. Returns `true` only for the currently pending ticket,
    /// which is then cleared.
    pub fn fire(&mut self, ticket: TimerTicket) -> bool {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel the pending run, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a run is scheduled and not yet claimed.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = Arc::new(Mutex::new(DelayTimer::new()));
        let fired = Arc::new(Mutex::new(0));

        let t = timer.clone();
        let f = fired.clone();
        timer
            .lock()
            .schedule(&Handle::current(), Duration::from_millis(50), move |ticket| {
                if t.lock().fire(ticket) {
                    *f.lock() += 1;
                }
            });
        assert!(timer.lock().is_pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock(), 1);
        assert!(!timer.lock().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let timer = Arc::new(Mutex::new(DelayTimer::new()));
        let fired = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let t = timer.clone();
            let f = fired.clone();
            timer
                .lock()
                .schedule(&Handle::current(), Duration::from_millis(20), move |ticket| {
                    if t.lock().fire(ticket) {
                        f.lock().push(label);
                    }
                });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock(), vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let timer = Arc::new(Mutex::new(DelayTimer::new()));
        let fired = Arc::new(Mutex::new(false));

        let t = timer.clone();
        let f = fired.clone();
        let ticket = timer
            .lock()
            .schedule(&Handle::current(), Duration::from_millis(20), move |ticket| {
                if t.lock().fire(ticket) {
                    *f.lock() = true;
                }
            });
        assert!(timer.lock().cancel());
        assert!(!timer.lock().fire(ticket));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*fired.lock());
    }
}
