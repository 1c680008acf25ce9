use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A manual-reset event.
///
/// Stays signaled until explicitly reset, so late waiters always observe
/// the signal.  Blocking waits suit the engine's callers: suspended
/// allocators run on arbitrary caller threads, bind phases on pool workers.
#[derive(Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.lock()
    }

    pub fn wait(&self) {
        let mut signaled = self.state.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Returns false if the timeout elapsed before the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.lock();
        while !*signaled {
            if self.cond.wait_for(&mut signaled, timeout).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

const SIGNAL_PENDING: u8 = 0;
const SIGNAL_OK: u8 = 1;
const SIGNAL_FAILED: u8 = 2;

/// A signal-once, manual-reset completion marker carrying an ok/failed
/// outcome.
///
/// Used for per-store bind-complete and relocation-complete coordination.
/// A failed store still completes its signal, with the failed marker set,
/// so dependents waiting on it wake instead of hanging; they must check
/// the outcome before trusting the store's data.
pub struct CompletionSignal {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
    event: Event,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SIGNAL_PENDING),
            reason: Mutex::new(None),
            event: Event::new(),
        }
    }

    /// Marks the signal completed successfully.  First completion wins.
    pub fn complete_ok(&self) {
        if self
            .state
            .compare_exchange(
                SIGNAL_PENDING,
                SIGNAL_OK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.event.signal();
        }
    }

    /// Marks the signal completed with a failure.  First completion wins.
    pub fn complete_failed(&self, reason: impl Into<String>) {
        if self
            .state
            .compare_exchange(
                SIGNAL_PENDING,
                SIGNAL_FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            *self.reason.lock() = Some(reason.into());
            self.event.signal();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) != SIGNAL_PENDING
    }

    /// Outcome if completed: `Some(true)` on success, `Some(false)` on
    /// failure.
    pub fn outcome(&self) -> Option<bool> {
        match self.state.load(Ordering::Acquire) {
            SIGNAL_OK => Some(true),
            SIGNAL_FAILED => Some(false),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Blocks until completed; returns true when the outcome was ok.
    pub fn wait(&self) -> bool {
        self.event.wait();
        self.state.load(Ordering::Acquire) == SIGNAL_OK
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        if self.event.wait_timeout(timeout) {
            Some(self.state.load(Ordering::Acquire) == SIGNAL_OK)
        } else {
            None
        }
    }
}

/// A counted batch of per-store work items belonging to one bind phase.
///
/// The active count is the single source of truth for phase completion:
/// it only decreases, and it reaches zero exactly once, which is the only
/// legal trigger for signaling the completion event.
pub struct BindWork {
    total: usize,
    active: AtomicUsize,
    failed: AtomicUsize,
    complete: Event,
}

impl BindWork {
    pub fn new(total: usize) -> Self {
        let work = Self {
            total,
            active: AtomicUsize::new(total),
            failed: AtomicUsize::new(0),
            complete: Event::new(),
        };
        if total == 0 {
            work.complete.signal();
        }
        work
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete.is_signaled()
    }

    pub fn completion_event(&self) -> &Event {
        &self.complete
    }

    /// Records one item's completion.  Returns true when this was the last
    /// active item and the completion event was signaled.
    ///
    /// Each work item completes exactly once; a double decrement is a
    /// correctness bug upstream.
    pub fn complete_item(&self, item_failed: bool) -> bool {
        if item_failed {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "bind work active count underflow");
        if previous == 1 {
            self.complete.signal();
            true
        } else {
            false
        }
    }
}
