//! Pace limiting for storage background work.
//!
//! A [`PaceLimiter`] lets any number of high-priority operations mark
//! themselves active while low-priority operations periodically call
//! [`PaceLimiter::wait_if_needed`] and park until no high-priority operation
//! is left.
//!
//! ```text
//!            inc() 0 -> 1
//!   Open  ─────────────────▶  Throttled
//!  (n == 0)                    (n > 0)
//!     ▲                           │
//!     └───────────────────────────┘
//!        dec() 1 -> 0, wake all
//! ```
//!
//! Waiting is unbounded. Low-priority work is expected to call
//! `wait_if_needed` between chunks of its own loop, so cancellation stays with
//! the caller.
//!
//! [`StoragePacers`] wires two limiters to the roles the storage engine uses.

mod pacers;

pub use pacers::StoragePacers;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Priority gate between high-priority and low-priority work.
///
/// Every [`inc`](Self::inc) must be paired with exactly one later
/// [`dec`](Self::dec) by the same logical operation. Prefer
/// [`enter`](Self::enter), which pairs them through a guard.
#[derive(Debug, Default)]
pub struct PaceLimiter {
    n: Mutex<i64>,
    cond: Condvar,
    delays_total: AtomicU64,
}

impl PaceLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one more high-priority operation as active.
    pub fn inc(&self) {
        *self.n.lock() += 1;
    }

    /// Marks a high-priority operation as finished.
    ///
    /// Wakes every waiter once no high-priority operation is left.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called more often than [`inc`](Self::inc).
    pub fn dec(&self) {
        let mut n = self.n.lock();
        *n -= 1;
        debug_assert!(*n >= 0, "BUG: pace limiter balance cannot be negative: {}", *n);
        if *n == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks while any high-priority operation is active.
    ///
    /// Returns immediately in the open state. Every park is counted in
    /// [`delays_total`](Self::delays_total).
    pub fn wait_if_needed(&self) {
        let mut n = self.n.lock();
        // Re-check after every wakeup: spurious wakeups happen, and another
        // inc() may land between the broadcast and this thread running.
        while *n > 0 {
            self.delays_total.fetch_add(1, Ordering::Relaxed);
            self.cond.wait(&mut n);
        }
    }

    /// Number of times a caller had to park in `wait_if_needed`.
    pub fn delays_total(&self) -> u64 {
        self.delays_total.load(Ordering::Relaxed)
    }

    /// Number of currently active high-priority operations.
    pub fn active(&self) -> i64 {
        *self.n.lock()
    }

    /// Calls `inc` now and `dec` when the returned guard is dropped.
    pub fn enter(&self) -> PaceGuard<'_> {
        self.inc();
        PaceGuard { limiter: self }
    }
}

/// Keeps a high-priority operation registered on a [`PaceLimiter`].
#[must_use = "dropping the guard immediately releases the limiter"]
#[derive(Debug)]
pub struct PaceGuard<'a> {
    limiter: &'a PaceLimiter,
}

impl Drop for PaceGuard<'_> {
    fn drop(&mut self) {
        self.limiter.dec();
    }
}
