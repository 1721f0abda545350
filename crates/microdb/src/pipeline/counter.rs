use core::ops::Range;
use parking_lot::Mutex;
use tracing::instrument;

/// A contiguous block of IDs handed to one worker.
///
/// An empty grant (`count() == 0`) tells the worker there is no more work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationGrant {
    ids: Range<u64>,
}

impl AllocationGrant {
    /// The grant that signals "no more IDs".
    pub const fn exhausted() -> Self {
        Self { ids: 0..0 }
    }

    pub const fn count(&self) -> u64 {
        self.ids.end - self.ids.start
    }

    pub const fn is_exhausted(&self) -> bool {
        self.count() == 0
    }

    pub fn ids(&self) -> Range<u64> {
        self.ids.clone()
    }
}

#[derive(Debug)]
struct Counters {
    next_id: u64,
    remaining: u64,
    written: u64,
}

/// The pipeline's global counters, all behind one exclusive lock.
///
/// `next_id` only grows and `remaining` only shrinks. Every ID in
/// `1..next_id` has been handed out exactly once.
#[derive(Debug)]
pub struct SharedCounterState {
    total: u64,
    counters: Mutex<Counters>,
}

impl SharedCounterState {
    /// Creates counters for `total` records with IDs starting at 1.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            counters: Mutex::new(Counters {
                next_id: 1,
                remaining: total,
                written: 0,
            }),
        }
    }

    /// Grants up to `max_batch` consecutive IDs.
    ///
    /// Returns an exhausted grant once every ID has been handed out. The
    /// whole read-modify-write happens under the lock, so concurrent callers
    /// receive disjoint ranges with no gaps between them.
    #[instrument(level = "trace", skip(self))]
    pub fn request_block(&self, max_batch: u64) -> AllocationGrant {
        let mut counters = self.counters.lock();
        if counters.remaining == 0 {
            return AllocationGrant::exhausted();
        }

        let give = counters.remaining.min(max_batch);
        let start = counters.next_id;
        counters.next_id += give;
        counters.remaining -= give;
        AllocationGrant {
            ids: start..start + give,
        }
    }

    /// Counts one more persisted record and returns the new total.
    pub fn record_written(&self) -> u64 {
        let mut counters = self.counters.lock();
        counters.written += 1;
        counters.written
    }

    pub const fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.counters.lock().remaining
    }

    pub fn next_id(&self) -> u64 {
        self.counters.lock().next_id
    }

    pub fn written(&self) -> u64 {
        self.counters.lock().written
    }
}
