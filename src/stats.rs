//! Per-handle allocation statistics.
//!
//! Counters are updated on every allocation outcome and are monotonically
//! non-decreasing for the lifetime of a handle. Two collection strategies
//! are selected at build time:
//!
//! * default: each counter is an independent [`AtomicU64`] with
//!   sequentially-consistent ordering. A snapshot is six separate loads, so
//!   it is not a single atomic slice across all fields, but each field
//!   individually reflects a prior update.
//! * `locked-stats`: the six counters share one [`Mutex`]; snapshots are a
//!   consistent six-tuple.

use std::ops::AddAssign;

/// Snapshot of a handle's six allocation counters.
///
/// Also used internally as a sparse delta: an operation builds the increment
/// it owes and applies it in one step, which keeps compound updates (realloc
/// touches four fields) inside a single critical section in locked mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_failed: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub bytes_failed: u64,
}

impl AllocStats {
    /// Blocks handed out and not yet returned.
    pub fn live_blocks(&self) -> u64 {
        self.blocks_allocated.saturating_sub(self.blocks_freed)
    }

    /// Bytes handed out and not yet returned.
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_freed)
    }
}

impl AddAssign for AllocStats {
    fn add_assign(&mut self, rhs: AllocStats) {
        self.blocks_allocated += rhs.blocks_allocated;
        self.blocks_freed += rhs.blocks_freed;
        self.blocks_failed += rhs.blocks_failed;
        self.bytes_allocated += rhs.bytes_allocated;
        self.bytes_freed += rhs.bytes_freed;
        self.bytes_failed += rhs.bytes_failed;
    }
}

#[cfg(not(feature = "locked-stats"))]
pub(crate) use lock_free::Counters;

#[cfg(not(feature = "locked-stats"))]
mod lock_free {
    use super::AllocStats;
    use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

    #[derive(Debug, Default)]
    pub(crate) struct Counters {
        blocks_allocated: AtomicU64,
        blocks_freed: AtomicU64,
        blocks_failed: AtomicU64,
        bytes_allocated: AtomicU64,
        bytes_freed: AtomicU64,
        bytes_failed: AtomicU64,
    }

    impl Counters {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn apply(&self, delta: AllocStats) {
            if delta.blocks_allocated != 0 {
                self.blocks_allocated.fetch_add(delta.blocks_allocated, SeqCst);
            }
            if delta.blocks_freed != 0 {
                self.blocks_freed.fetch_add(delta.blocks_freed, SeqCst);
            }
            if delta.blocks_failed != 0 {
                self.blocks_failed.fetch_add(delta.blocks_failed, SeqCst);
            }
            if delta.bytes_allocated != 0 {
                self.bytes_allocated.fetch_add(delta.bytes_allocated, SeqCst);
            }
            if delta.bytes_freed != 0 {
                self.bytes_freed.fetch_add(delta.bytes_freed, SeqCst);
            }
            if delta.bytes_failed != 0 {
                self.bytes_failed.fetch_add(delta.bytes_failed, SeqCst);
            }
        }

        pub(crate) fn snapshot(&self) -> AllocStats {
            AllocStats {
                blocks_allocated: self.blocks_allocated.load(SeqCst),
                blocks_freed: self.blocks_freed.load(SeqCst),
                blocks_failed: self.blocks_failed.load(SeqCst),
                bytes_allocated: self.bytes_allocated.load(SeqCst),
                bytes_freed: self.bytes_freed.load(SeqCst),
                bytes_failed: self.bytes_failed.load(SeqCst),
            }
        }
    }
}

#[cfg(feature = "locked-stats")]
pub(crate) use locked::Counters;

#[cfg(feature = "locked-stats")]
mod locked {
    use super::AllocStats;
    use std::sync::{Mutex, PoisonError};

    #[derive(Debug, Default)]
    pub(crate) struct Counters {
        inner: Mutex<AllocStats>,
    }

    impl Counters {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn apply(&self, delta: AllocStats) {
            let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            *stats += delta;
        }

        pub(crate) fn snapshot(&self) -> AllocStats {
            *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}
