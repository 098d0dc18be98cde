//! Fixed-bucket shell over the ordered chains.
//!
//! The bucket array is sized once at construction and never grows; each
//! operation hashes its key, picks `hash mod N`, and forwards to that
//! bucket's chain together with the caller's worker state. Load factor is
//! the caller's concern.

use core::alloc::Layout;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use foldhash::fast::FixedState;

use crate::epoch::EpochState;
use crate::errors::Error;
use crate::list::OrderedList;
use crate::node::Node;
use crate::pool::{BlockPool, Heap, Upstream};
use crate::worker::WorkerState;

/// Tuning knobs fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Announcement slots available to [`Petek::register_worker`]. Workers
    /// never give their slot back, so this bounds the total number of
    /// registrations over the table's lifetime.
    pub max_workers: usize,
    /// Mutating operations a worker performs between announce-and-release
    /// cycles. Lower values reclaim sooner at the price of more scans over
    /// the announcement slots.
    pub minor_ticks_per_major: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 1024,
            minor_ticks_per_major: 10_000,
        }
    }
}

/// Lock-free fixed-bucket hash table with epoch-based reclamation.
///
/// Values travel by copy and are stored in an atomic cell, so they must fit
/// a machine word (debug-checked at construction). Keys need a total order
/// for the chain discipline on top of hashing.
///
/// Every operation takes a [`WorkerState`] registered with this table; the
/// state carries the thread-local allocator and the reclamation queue, the
/// table itself holds only the shared chain pointers and epoch slots.
pub struct Petek<K, V, S = FixedState> {
    buckets: Box<[OrderedList<K, V>]>,
    hasher: S,
    epochs: Arc<EpochState>,
    ticks_per_major: u64,
}

impl<K, V> Petek<K, V, FixedState>
where
    K: Ord + Hash + 'static,
    V: Copy + 'static,
{
    /// Creates a table with `bucket_count` buckets and default [`Config`].
    pub fn new(bucket_count: usize) -> Self {
        Self::with_config(bucket_count, Config::default())
    }

    /// Creates a table with explicit tuning knobs.
    pub fn with_config(bucket_count: usize, config: Config) -> Self {
        Self::with_config_and_hasher(bucket_count, config, FixedState::default())
    }
}

impl<K, V, S> Petek<K, V, S>
where
    K: Ord + Hash + 'static,
    V: Copy + 'static,
    S: BuildHasher,
{
    /// Creates a table with a caller-supplied hasher and default [`Config`].
    ///
    /// The hasher must stay deterministic for the table's lifetime; it is
    /// consulted on every operation.
    pub fn with_hasher(bucket_count: usize, hasher: S) -> Self {
        Self::with_config_and_hasher(bucket_count, Config::default(), hasher)
    }

    /// Creates a table with explicit tuning knobs and hasher.
    pub fn with_config_and_hasher(bucket_count: usize, config: Config, hasher: S) -> Self {
        assert!(bucket_count >= 1, "a table needs at least one bucket");
        assert!(
            config.minor_ticks_per_major >= 1,
            "the tick cadence must be nonzero"
        );
        debug_assert!(
            AtomicCell::<V>::is_lock_free(),
            "values must load and store as a single machine word"
        );
        let buckets = (0..bucket_count).map(|_| OrderedList::new()).collect();
        Self {
            buckets,
            hasher,
            epochs: Arc::new(EpochState::new(config.max_workers)),
            ticks_per_major: config.minor_ticks_per_major,
        }
    }

    /// The pool size class for this table's entries. Worker pools must be
    /// built with exactly this layout.
    pub fn entry_layout() -> Layout {
        Node::<K, V>::layout()
    }

    /// Claims an announcement slot for `state` and hands it this table's
    /// epoch handle. Must happen exactly once per worker state, before its
    /// first operation.
    pub fn register_worker<U: Upstream>(&self, state: &mut WorkerState<U>) -> Result<(), Error> {
        let index = self.epochs.register()?;
        state.install(Arc::clone(&self.epochs), index, self.ticks_per_major);
        Ok(())
    }

    /// Builds a heap-backed worker state and registers it in one step.
    pub fn worker(&self) -> Result<WorkerState<Heap>, Error> {
        let mut state = WorkerState::new(BlockPool::new(Heap, Self::entry_layout()));
        self.register_worker(&mut state)?;
        Ok(state)
    }

    fn bucket<U: Upstream>(&self, state: &WorkerState<U>, key: &K) -> &OrderedList<K, V> {
        // A worker without a slot in THIS table's epoch state has no
        // protection against reclamation while it walks a chain.
        debug_assert!(
            state.belongs_to(&self.epochs),
            "worker state is not registered with this table"
        );
        let hash = self.hasher.hash_one(key);
        &self.buckets[(hash as usize) % self.buckets.len()]
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get<U: Upstream>(&self, state: &mut WorkerState<U>, key: &K) -> Option<V> {
        self.bucket(state, key).find(state, key)
    }

    /// Inserts `key`, or overwrites its value in place. `Ok(true)` means a
    /// new entry was created.
    ///
    /// On allocation failure nothing is linked and the table is unchanged.
    pub fn put<U: Upstream>(
        &self,
        state: &mut WorkerState<U>,
        key: K,
        value: V,
    ) -> Result<bool, Error> {
        let result = self.bucket(state, &key).put(state, key, value);
        state.minor_tick();
        result
    }

    /// Applies `f` to the value stored under `key` and writes the result
    /// back, returning the previous value.
    ///
    /// Load-compute-store at word granularity: concurrent writers to the
    /// same key can interleave between the load and the store, and one side
    /// loses silently. Use [`Petek::update_strict`] when that matters.
    pub fn update<U, F>(&self, state: &mut WorkerState<U>, key: &K, f: F) -> Option<V>
    where
        U: Upstream,
        F: FnOnce(V) -> V,
    {
        let result = self.bucket(state, key).update(state, key, f);
        state.minor_tick();
        result
    }

    /// Read-modify-write variant of [`Petek::update`]: `f` is re-run until
    /// its result lands on the exact value it was computed from.
    pub fn update_strict<U, F>(&self, state: &mut WorkerState<U>, key: &K, f: F) -> Option<V>
    where
        U: Upstream,
        V: Eq,
        F: FnMut(V) -> V,
    {
        let result = self.bucket(state, key).update_strict(state, key, f);
        state.minor_tick();
        result
    }

    /// Removes `key`'s entry. Returns false when no live entry carries the
    /// key; that is not an error.
    pub fn erase<U: Upstream>(&self, state: &mut WorkerState<U>, key: &K) -> bool {
        let result = self.bucket(state, key).erase(state, key);
        state.minor_tick();
        result
    }

    /// Number of buckets fixed at construction.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
