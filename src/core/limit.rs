//! Shared, runtime-adjustable concurrency ceiling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of jobs in flight at once.
///
/// Clones share the same value. The scheduler re-reads it on every admission
/// pass, so a change made through any clone applies from the next pass on;
/// lowering it never preempts running jobs.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    max: Arc<AtomicUsize>,
}

impl ConcurrencyLimit {
    /// Values below 1 are raised to 1.
    pub fn new(max: usize) -> Self {
        Self {
            max: Arc::new(AtomicUsize::new(max.max(1))),
        }
    }

    pub fn get(&self) -> usize {
        self.max.load(Ordering::Acquire)
    }

    /// Store a new ceiling (at least 1). Returns the previous value.
    pub fn set(&self, max: usize) -> usize {
        self.max.swap(max.max(1), Ordering::AcqRel)
    }

    /// Free slots given `active` running jobs. 0 when over the ceiling.
    pub fn available(&self, active: usize) -> usize {
        self.get().saturating_sub(active)
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self::new(3)
    }
}
