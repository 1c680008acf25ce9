//! Record allocation strategies and the suspended-allocator gate.
//!
//! Every store carries one strategy, chosen from its declared traits when
//! the context is built and installed for good once the store's bind
//! completes.  Until then allocations park on the gate instead of failing.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::config::{StoreTraits, round_up};
use crate::sync::Event;

/// How a store's allocation cursor advances.
///
/// The two axes are orthogonal: concurrency decides whether the advance is
/// an interlocked compare-and-swap or a plain store, alignment decides the
/// granularity each allocation is rounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorStrategy {
    /// Single-threaded callers, byte-packed allocations.
    ExclusivePacked,
    /// Single-threaded callers, page-multiple allocations.
    ExclusivePageAligned,
    /// Interlocked cursor, byte-packed allocations.
    ConcurrentPacked,
    /// Interlocked cursor, page-multiple allocations.
    ConcurrentPageAligned,
}

impl AllocatorStrategy {
    pub fn select(traits: StoreTraits) -> Self {
        match (traits.concurrent_allocations, traits.page_aligned) {
            (false, false) => AllocatorStrategy::ExclusivePacked,
            (false, true) => AllocatorStrategy::ExclusivePageAligned,
            (true, false) => AllocatorStrategy::ConcurrentPacked,
            (true, true) => AllocatorStrategy::ConcurrentPageAligned,
        }
    }

    #[inline]
    pub fn is_concurrent(self) -> bool {
        matches!(
            self,
            AllocatorStrategy::ConcurrentPacked | AllocatorStrategy::ConcurrentPageAligned
        )
    }

    #[inline]
    pub fn is_page_aligned(self) -> bool {
        matches!(
            self,
            AllocatorStrategy::ExclusivePageAligned | AllocatorStrategy::ConcurrentPageAligned
        )
    }

    /// Total bytes an allocation of `len` occupies under this strategy.
    #[inline]
    pub fn aligned_len(self, len: u64, page_size: u64) -> u64 {
        if self.is_page_aligned() {
            round_up(len, page_size)
        } else {
            len
        }
    }

    /// Attempts to advance `cursor` by `len` without crossing `limit`.
    /// Returns the allocation's starting offset.
    pub(crate) fn advance(self, cursor: &AtomicU64, len: u64, limit: u64) -> Option<u64> {
        if self.is_concurrent() {
            cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    let next = current.checked_add(len)?;
                    if next > limit { None } else { Some(next) }
                })
                .ok()
        } else {
            // Exclusive stores have at most one allocating thread.
            let current = cursor.load(Ordering::Acquire);
            let next = current.checked_add(len)?;
            if next > limit {
                return None;
            }
            cursor.store(next, Ordering::Release);
            Some(current)
        }
    }
}

const GATE_SUSPENDED: u8 = 0;
const GATE_READY: u8 = 1;
const GATE_FAILED: u8 = 2;

/// Gates allocation until the store's bind pipeline publishes an outcome.
///
/// Starts suspended.  Callers arriving early block on the resume event;
/// publication stores the state before signaling, so a woken waiter always
/// observes the final state.
pub struct AllocatorGate {
    state: AtomicU8,
    resume: Event,
}

impl Default for AllocatorGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(GATE_SUSPENDED),
            resume: Event::new(),
        }
    }

    pub fn publish_ready(&self) {
        self.state.store(GATE_READY, Ordering::Release);
        self.resume.signal();
    }

    /// A failed store also wakes its waiters; they observe the failed
    /// state and give up instead of hanging.
    pub fn publish_failed(&self) {
        self.state.store(GATE_FAILED, Ordering::Release);
        self.resume.signal();
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_READY
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_SUSPENDED
    }

    /// Blocks until an outcome is published.  Returns true when the store
    /// became ready.
    pub fn wait_ready(&self) -> bool {
        if self.is_suspended() {
            self.resume.wait();
        }
        self.is_ready()
    }
}
