//! Table-scoped epoch state.
//!
//! One monotonic 64-bit counter stamps every deferred-release entry, and a
//! fixed array of per-worker announcement slots records how far each worker
//! has observed it. The minimum announced value is the safe epoch: a
//! deferred block whose stamp sits below it can no longer be reached by any
//! worker and may be released.
//!
//! The counter starts at 1 so the zero-initialized slots of workers that
//! have not announced yet sit below every real stamp, holding reclamation
//! back until they do.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::errors::Error;

/// Slot value of a worker that has left; it no longer bounds the safe epoch.
pub(crate) const DEPARTED: u64 = u64::MAX;

pub(crate) struct EpochState {
    epoch: CachePadded<AtomicU64>,
    workers: CachePadded<AtomicUsize>,
    announced: Box<[CachePadded<AtomicU64>]>,
}

impl EpochState {
    pub(crate) fn new(max_workers: usize) -> Self {
        assert!(max_workers >= 1, "a table needs at least one worker slot");
        let announced = (0..max_workers)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self {
            epoch: CachePadded::new(AtomicU64::new(1)),
            workers: CachePadded::new(AtomicUsize::new(0)),
            announced,
        }
    }

    /// Claims the next announcement slot.
    pub(crate) fn register(&self) -> Result<usize, Error> {
        let mut claimed = self.workers.load(Ordering::Relaxed);
        loop {
            if claimed >= self.announced.len() {
                return Err(Error::WorkersExhausted {
                    max_workers: self.announced.len(),
                });
            }
            match self.workers.compare_exchange(
                claimed,
                claimed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(claimed),
                Err(actual) => claimed = actual,
            }
        }
    }

    /// Draws a fresh stamp for a deferred-release entry.
    pub(crate) fn stamp(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel)
    }

    /// Publishes worker `index`'s view of the global counter: everything it
    /// still references is at least this recent.
    pub(crate) fn announce(&self, index: usize) {
        let now = self.epoch.load(Ordering::Acquire);
        self.announced[index].store(now, Ordering::Release);
    }

    /// Marks worker `index` as departed.
    pub(crate) fn leave(&self, index: usize) {
        self.announced[index].store(DEPARTED, Ordering::Release);
    }

    /// Minimum announced epoch across every registered worker.
    pub(crate) fn safe_epoch(&self) -> u64 {
        let workers = self.workers.load(Ordering::Acquire).min(self.announced.len());
        let mut safe = u64::MAX;
        for slot in &self.announced[..workers] {
            safe = safe.min(slot.load(Ordering::Acquire));
        }
        safe
    }
}
