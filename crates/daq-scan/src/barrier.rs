//! Completion barrier.
//!
//! Counts the asynchronous completions a phase is waiting for. The automaton
//! issues every write of a phase, arms the barrier with the exact count, and
//! is re-entered once when the count drains to zero.
//!
//! Every arming gets a fresh generation. A completion carries the [`Ticket`] it
//! was issued with, so a completion that belongs to an earlier arming (a
//! killed scan, an expired deadline) is recognised as stale and ignored.
//!
//! While a scan aborts, the barrier switches to draining: completions are
//! still counted down, but report [`BarrierEvent::Absorbed`] instead of
//! [`BarrierEvent::Released`] so the abort path, not the phase logic, decides
//! what happens next.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What the outstanding completions are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierKind {
    /// Positioner moves (including retrace).
    Positioner,
    /// Detector triggers.
    Trigger,
    /// Before/after-scan hook.
    Hook,
}

impl std::fmt::Display for BarrierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierKind::Positioner => write!(f, "positioner"),
            BarrierKind::Trigger => write!(f, "trigger"),
            BarrierKind::Hook => write!(f, "hook"),
        }
    }
}

/// Identifies the arming a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    /// Barrier generation at arming time.
    pub generation: u64,
    /// What was armed.
    pub kind: BarrierKind,
}

/// Result of delivering one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierEvent {
    /// The last expected completion arrived; re-enter the automaton.
    Released,
    /// More completions are still expected.
    Pending {
        /// Completions still outstanding.
        remaining: usize,
    },
    /// The completion belongs to an earlier arming and was discarded.
    Stale,
    /// Counted while draining; `remaining == 0` means the drain finished.
    Absorbed {
        /// Completions still outstanding.
        remaining: usize,
    },
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BarrierStats {
    /// Times the barrier released.
    pub released: u64,
    /// Completions absorbed while draining.
    pub absorbed: u64,
    /// Completions discarded as stale.
    pub stale: u64,
    /// Armings that hit their deadline.
    pub expired: u64,
}

/// Outstanding-completion counter for one scan.
#[derive(Debug)]
pub struct CompletionBarrier {
    generation: u64,
    kind: BarrierKind,
    outstanding: usize,
    draining: bool,
    deadline: Option<Instant>,
    stats: BarrierStats,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    /// Idle barrier.
    pub fn new() -> Self {
        Self {
            generation: 0,
            kind: BarrierKind::Positioner,
            outstanding: 0,
            draining: false,
            deadline: None,
            stats: BarrierStats::default(),
        }
    }

    /// Arm for `count` completions of `kind`, with an optional deadline.
    ///
    /// Arming with zero leaves the barrier idle; the caller re-enters directly.
    /// Arming always starts a new generation, so anything still in flight from
    /// a previous arming becomes stale.
    pub fn expect(&mut self, kind: BarrierKind, count: usize, timeout: Option<Duration>) -> Ticket {
        self.generation += 1;
        self.kind = kind;
        self.outstanding = count;
        self.draining = false;
        self.deadline = timeout
            .filter(|_| count > 0)
            .map(|timeout| Instant::now() + timeout);
        Ticket {
            generation: self.generation,
            kind,
        }
    }

    /// Deliver one completion.
    pub fn complete(&mut self, ticket: Ticket) -> BarrierEvent {
        if ticket.generation != self.generation || self.outstanding == 0 {
            self.stats.stale += 1;
            return BarrierEvent::Stale;
        }
        self.outstanding -= 1;
        if self.outstanding == 0 {
            self.deadline = None;
        }

        if self.draining {
            self.stats.absorbed += 1;
            if self.outstanding == 0 {
                self.draining = false;
            }
            BarrierEvent::Absorbed {
                remaining: self.outstanding,
            }
        } else if self.outstanding == 0 {
            self.stats.released += 1;
            BarrierEvent::Released
        } else {
            BarrierEvent::Pending {
                remaining: self.outstanding,
            }
        }
    }

    /// Keep counting completions but stop releasing. Returns how many are still
    /// outstanding; zero means there is nothing to drain.
    pub fn drain(&mut self) -> usize {
        self.draining = self.outstanding > 0;
        self.outstanding
    }

    /// Forget every outstanding completion. Late arrivals become stale.
    /// Returns how many were dropped.
    pub fn invalidate(&mut self) -> usize {
        let dropped = self.outstanding;
        self.generation += 1;
        self.outstanding = 0;
        self.draining = false;
        self.deadline = None;
        dropped
    }

    /// Deadline expiry for the arming identified by `ticket`.
    ///
    /// Returns the number of completions that never arrived, or `None` when
    /// the arming already drained or was replaced.
    pub fn expire(&mut self, ticket: Ticket) -> Option<usize> {
        if ticket.generation != self.generation || self.outstanding == 0 {
            return None;
        }
        self.stats.expired += 1;
        Some(self.invalidate())
    }

    /// Completions still outstanding.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Kind of the current (or last) arming.
    pub fn kind(&self) -> BarrierKind {
        self.kind
    }

    /// Whether completions are being absorbed for an abort.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// When the current arming times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Counters since creation.
    pub fn stats(&self) -> BarrierStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_release_once() {
        let mut barrier = CompletionBarrier::new();
        let ticket = barrier.expect(BarrierKind::Positioner, 2, None);
        assert_eq!(barrier.complete(ticket), BarrierEvent::Pending { remaining: 1 });
        assert_eq!(barrier.complete(ticket), BarrierEvent::Released);
        assert_eq!(barrier.complete(ticket), BarrierEvent::Stale);
        assert_eq!(barrier.stats().released, 1);
    }

    #[test]
    fn test_rearm_makes_old_ticket_stale() {
        let mut barrier = CompletionBarrier::new();
        let old = barrier.expect(BarrierKind::Positioner, 1, None);
        barrier.invalidate();
        let new = barrier.expect(BarrierKind::Trigger, 1, None);
        assert_eq!(barrier.complete(old), BarrierEvent::Stale);
        assert_eq!(barrier.complete(new), BarrierEvent::Released);
    }

    #[test]
    fn test_drain_absorbs_without_release() {
        let mut barrier = CompletionBarrier::new();
        let ticket = barrier.expect(BarrierKind::Trigger, 3, None);
        barrier.complete(ticket);
        assert_eq!(barrier.drain(), 2);
        assert!(barrier.is_draining());
        assert_eq!(barrier.complete(ticket), BarrierEvent::Absorbed { remaining: 1 });
        assert_eq!(barrier.complete(ticket), BarrierEvent::Absorbed { remaining: 0 });
        assert!(!barrier.is_draining());
        assert_eq!(barrier.stats().absorbed, 2);
        assert_eq!(barrier.stats().released, 0);
    }

    #[test]
    fn test_drain_with_nothing_outstanding() {
        let mut barrier = CompletionBarrier::new();
        assert_eq!(barrier.drain(), 0);
        assert!(!barrier.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let mut barrier = CompletionBarrier::new();
        let ticket = barrier.expect(BarrierKind::Positioner, 2, Some(Duration::from_secs(1)));
        assert!(barrier.deadline().is_some());
        barrier.complete(ticket);
        assert_eq!(barrier.expire(ticket), Some(1));
        assert_eq!(barrier.complete(ticket), BarrierEvent::Stale);
        assert_eq!(barrier.expire(ticket), None);
        assert_eq!(barrier.stats().expired, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_release_once() {
        for count in [1usize, 5, 32] {
            let barrier = Arc::new(Mutex::new(CompletionBarrier::new()));
            let releases = Arc::new(AtomicUsize::new(0));
            let ticket = barrier.lock().expect(BarrierKind::Trigger, count, None);

            let tasks: Vec<_> = (0..count)
                .map(|i| {
                    let barrier = barrier.clone();
                    let releases = releases.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_micros((i as u64 * 37) % 500)).await;
                        if barrier.lock().complete(ticket) == BarrierEvent::Released {
                            releases.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }
    }

    proptest! {
        /// Arming with n and completing n times releases exactly once, no
        /// matter how stale completions are interleaved.
        #[test]
        fn release_exactly_once(
            count in 0usize..64,
            stale_pattern in proptest::collection::vec(any::<bool>(), 0..128),
        ) {
            let mut barrier = CompletionBarrier::new();
            let stale = barrier.expect(BarrierKind::Positioner, 3, None);
            barrier.invalidate();
            let ticket = barrier.expect(BarrierKind::Positioner, count, None);

            let mut releases = usize::from(count == 0);
            for i in 0..count {
                if stale_pattern.get(i).copied().unwrap_or(false) {
                    prop_assert_eq!(barrier.complete(stale), BarrierEvent::Stale);
                }
                if barrier.complete(ticket) == BarrierEvent::Released {
                    releases += 1;
                }
            }
            prop_assert_eq!(barrier.complete(ticket), BarrierEvent::Stale);
            prop_assert_eq!(releases, 1);
            prop_assert_eq!(barrier.outstanding(), 0);
        }
    }
}
