//! Thread-local worker context.
//!
//! Every table operation threads a `WorkerState` through: it owns the pool
//! that serves node blocks, the queue of blocks waiting out their epoch, the
//! tick counter that paces reclamation, and the announcement slot claimed at
//! registration. A worker state belongs to exactly one thread and one table.
//!
//! Deferred entries carry a type-erased payload destructor so the queue can
//! outlive any scope where the node type is spelled; the destructor runs at
//! release time, never at enqueue time, because other workers may keep
//! reading the block until the safe epoch passes its stamp.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::epoch::EpochState;
use crate::pool::{BlockPool, Heap, Upstream};

type DropFn = unsafe fn(*mut u8);

struct Deferred {
    block: NonNull<u8>,
    layout: Layout,
    drop_payload: DropFn,
    epoch: u64,
}

/// Per-thread state threaded through every table operation.
pub struct WorkerState<U: Upstream = Heap> {
    pool: BlockPool<U>,
    deferred: VecDeque<Deferred>,
    ticks: u64,
    ticks_per_major: u64,
    index: usize,
    shared: Option<Arc<EpochState>>,
}

// SAFETY: deferred blocks are exclusively owned by this queue once unlinked;
// moving the state moves that ownership wholesale. Concurrent use from two
// threads is forbidden by the `&mut` receivers.
unsafe impl<U: Upstream + Send> Send for WorkerState<U> {}

impl<U: Upstream> WorkerState<U> {
    /// Creates an unregistered worker state over `pool`.
    ///
    /// The pool's size class must match the entry layout of the table this
    /// state is later registered with.
    pub fn new(pool: BlockPool<U>) -> Self {
        Self {
            pool,
            deferred: VecDeque::new(),
            ticks: 0,
            ticks_per_major: u64::MAX,
            index: usize::MAX,
            shared: None,
        }
    }

    /// The pool serving this worker's allocations.
    pub fn pool(&self) -> &BlockPool<U> {
        &self.pool
    }

    /// Whether this state has claimed an announcement slot yet.
    pub fn is_registered(&self) -> bool {
        self.shared.is_some()
    }

    /// Number of blocks still waiting out their epoch.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    /// Announces the current global epoch and releases everything that has
    /// aged out.
    ///
    /// Mutating operations do this on their own every
    /// `minor_ticks_per_major` calls. A worker that only reads never ticks,
    /// so it must call this periodically or it will pin the safe epoch and
    /// stall reclamation table-wide. No-op before registration.
    pub fn quiesce(&mut self) {
        let Some(shared) = self.shared.clone() else {
            return;
        };
        shared.announce(self.index);
        let safe = shared.safe_epoch();
        self.release_below(safe);
    }

    pub(crate) fn install(&mut self, shared: Arc<EpochState>, index: usize, ticks_per_major: u64) {
        debug_assert!(self.shared.is_none(), "worker state registered twice");
        self.shared = Some(shared);
        self.index = index;
        self.ticks = 0;
        self.ticks_per_major = ticks_per_major;
    }

    pub(crate) fn pool_mut(&mut self) -> &mut BlockPool<U> {
        &mut self.pool
    }

    pub(crate) fn belongs_to(&self, epochs: &Arc<EpochState>) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| Arc::ptr_eq(shared, epochs))
    }

    pub(crate) fn epochs(&self) -> &EpochState {
        self.shared
            .as_deref()
            .expect("worker state must be registered with a table before use")
    }

    /// Parks `block` until the safe epoch passes `epoch`.
    pub(crate) fn defer(
        &mut self,
        block: NonNull<u8>,
        layout: Layout,
        drop_payload: DropFn,
        epoch: u64,
    ) {
        self.deferred.push_back(Deferred {
            block,
            layout,
            drop_payload,
            epoch,
        });
    }

    /// Counts one mutating operation; every `ticks_per_major` of them runs
    /// an announce-and-release cycle.
    pub(crate) fn minor_tick(&mut self) {
        self.ticks += 1;
        if self.ticks >= self.ticks_per_major {
            self.ticks = 0;
            self.quiesce();
        }
    }

    /// Releases deferred entries in enqueue order while their stamp is
    /// below `safe`. Enqueue order is stamp order: stamps are drawn from a
    /// monotonic counter and this worker appends as it goes.
    fn release_below(&mut self, safe: u64) {
        let mut released = 0usize;
        while self.deferred.front().is_some_and(|entry| entry.epoch < safe) {
            let Some(entry) = self.deferred.pop_front() else {
                break;
            };
            // SAFETY: the stamp sits below every announced epoch, so no
            // worker can still reach the block; payload drop and block
            // release both happen exactly once, here.
            unsafe {
                (entry.drop_payload)(entry.block.as_ptr());
                self.pool.deallocate(entry.block, entry.layout);
            }
            released += 1;
        }
        if released > 0 {
            log::trace!(
                "worker {}: released {} blocks, {} still deferred",
                self.index,
                released,
                self.deferred.len()
            );
        }
    }
}

impl<U: Upstream> Drop for WorkerState<U> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.clone() else {
            return;
        };
        // Leave first so a dead worker's stale announcement cannot pin the
        // safe epoch for everyone else.
        shared.leave(self.index);
        let safe = shared.safe_epoch();
        self.release_below(safe);
        if !self.deferred.is_empty() {
            // Entries other workers may still reach cannot be freed here;
            // they are dropped from the queue without releasing the blocks.
            log::warn!(
                "worker {}: leaking {} deferred blocks still visible to other workers",
                self.index,
                self.deferred.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn registered(shared: &Arc<EpochState>, cadence: u64) -> WorkerState<Heap> {
        let mut state = WorkerState::new(BlockPool::new(Heap, Node::<u64, u64>::layout()));
        let index = shared.register().unwrap();
        state.install(Arc::clone(shared), index, cadence);
        state
    }

    fn defer_one(state: &mut WorkerState<Heap>) {
        let layout = Node::<u64, u64>::layout();
        let block = state.pool_mut().allocate(layout).unwrap();
        // SAFETY: block is writable and exclusively owned.
        unsafe { Node::init(block.as_ptr().cast::<Node<u64, u64>>(), 1, 2) };
        let epoch = state.epochs().stamp();
        state.defer(block, layout, Node::<u64, u64>::drop_payload_erased, epoch);
    }

    #[test]
    fn quiesce_releases_aged_entries() {
        let shared = Arc::new(EpochState::new(4));
        let mut state = registered(&shared, 1000);
        defer_one(&mut state);
        assert_eq!(state.pending(), 1);
        state.quiesce();
        assert_eq!(state.pending(), 0);
        assert_eq!(state.pool().stats().returned_blocks, 1);
    }

    #[test]
    fn silent_peer_blocks_release() {
        let shared = Arc::new(EpochState::new(4));
        let mut state = registered(&shared, 1000);
        let _silent = registered(&shared, 1000);
        defer_one(&mut state);
        state.quiesce();
        assert_eq!(state.pending(), 1, "a never-announcing peer pins the queue");
    }

    #[test]
    fn ticks_trigger_release_at_the_cadence() {
        let shared = Arc::new(EpochState::new(4));
        let mut state = registered(&shared, 3);
        defer_one(&mut state);
        state.minor_tick();
        state.minor_tick();
        assert_eq!(state.pending(), 1);
        state.minor_tick();
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn unregistered_state_is_inert() {
        let mut state: WorkerState<Heap> =
            WorkerState::new(BlockPool::new(Heap, Node::<u64, u64>::layout()));
        state.quiesce();
        assert_eq!(state.pending(), 0);
    }
}
