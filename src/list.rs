//! Lock-free ordered chain with mark-bit logical deletion.
//!
//! One chain backs one bucket. Entries sit strictly ascending by key
//! between a head and a tail sentinel. Removal is two-phase: an eraser
//! first sets the mark bit on the victim's successor word (logical
//! deletion), then any walker that crosses a run of marked nodes excises
//! the whole run with a single compare-and-swap and hands it to its
//! worker's deferred queue. Progress never depends on the eraser finishing
//! the unlink.
//!
//! Excised blocks stay readable by concurrent walkers until the safe epoch
//! passes their stamp; the deferred queue, not this module, decides when
//! they actually return to the pool.

use core::ptr::NonNull;

use crossbeam_utils::Backoff;

use crate::errors::Error;
use crate::node::Node;
use crate::pool::Upstream;
use crate::worker::WorkerState;

pub(crate) struct OrderedList<K, V> {
    head: *mut Node<K, V>,
    tail: *mut Node<K, V>,
}

// SAFETY: the raw head/tail pointers are owned by the list; all shared
// mutation goes through the nodes' atomic successor words. Keys are read and
// entries dropped from any thread that operates on the chain.
unsafe impl<K: Send, V: Send> Send for OrderedList<K, V> {}
unsafe impl<K: Send + Sync, V: Send> Sync for OrderedList<K, V> {}

impl<K: Ord, V: Copy> OrderedList<K, V> {
    pub(crate) fn new() -> Self {
        let head = Box::into_raw(Box::new(Node::sentinel()));
        let tail = Box::into_raw(Box::new(Node::sentinel()));
        // SAFETY: head is freshly allocated and unshared.
        unsafe { (*head).set_next(tail) };
        Self { head, tail }
    }

    /// Positions the caller around `key`.
    ///
    /// On return `left` is unmarked with `left.next == right` at the moment
    /// of the last check, and `right` is the first unmarked node whose key
    /// is not below `key`, or the tail sentinel. Any run of marked nodes
    /// crossed on the way is excised with a single CAS on `left.next`; the
    /// winner of that CAS defers every node of the run under one fresh
    /// stamp.
    fn search<U: Upstream>(
        &self,
        state: &mut WorkerState<U>,
        key: &K,
    ) -> (*mut Node<K, V>, *mut Node<K, V>) {
        let backoff = Backoff::new();
        loop {
            // SAFETY: every pointer followed here was read through an
            // acquire load from a node that was reachable during this walk;
            // the worker's announced epoch keeps all of them alive, marked
            // or not, until it next announces.
            unsafe {
                let mut left = self.head;
                let (mut t_next, mut t_marked) = (*self.head).next_and_mark();
                let mut left_next = t_next;
                let mut t = self.head;
                loop {
                    if !t_marked {
                        left = t;
                        left_next = t_next;
                    }
                    t = t_next;
                    if t == self.tail {
                        break;
                    }
                    let word = (*t).next_and_mark();
                    t_next = word.0;
                    t_marked = word.1;
                    if !t_marked && (*t).key() >= key {
                        break;
                    }
                }
                let right = t;

                if left_next == right {
                    if right != self.tail && (*right).is_marked() {
                        backoff.spin();
                        continue;
                    }
                    return (left, right);
                }

                // One CAS unlinks the whole marked run [left_next, right).
                if (*left).cas_next(left_next, right) {
                    let epoch = state.epochs().stamp();
                    let mut cursor = left_next;
                    while cursor != right {
                        let next = (*cursor).next_ptr();
                        state.defer(
                            NonNull::new_unchecked(cursor.cast::<u8>()),
                            Node::<K, V>::layout(),
                            Node::<K, V>::drop_payload_erased,
                            epoch,
                        );
                        cursor = next;
                    }
                    if right != self.tail && (*right).is_marked() {
                        backoff.spin();
                        continue;
                    }
                    return (left, right);
                }
                backoff.spin();
            }
        }
    }

    pub(crate) fn find<U: Upstream>(&self, state: &mut WorkerState<U>, key: &K) -> Option<V> {
        let (_, right) = self.search(state, key);
        // SAFETY: right is either the tail sentinel (checked) or a real
        // entry kept alive by the epoch protocol.
        unsafe {
            if right != self.tail && (*right).key() == key {
                Some((*right).value().load())
            } else {
                None
            }
        }
    }

    /// Inserts `key`, or refreshes its value in place when it is already
    /// present. `Ok(true)` means a new entry was linked.
    ///
    /// The node is allocated and built before the first search, so an
    /// allocation failure surfaces with nothing linked.
    pub(crate) fn put<U: Upstream>(
        &self,
        state: &mut WorkerState<U>,
        key: K,
        value: V,
    ) -> Result<bool, Error> {
        let layout = Node::<K, V>::layout();
        let block = state.pool_mut().allocate(layout)?;
        let node = block.as_ptr().cast::<Node<K, V>>();
        // SAFETY: block is writable and exclusively ours until linked.
        unsafe { Node::init(node, key, value) };

        let backoff = Backoff::new();
        loop {
            // SAFETY: node is unshared until the CAS below publishes it;
            // left/right obey the search contract.
            unsafe {
                let (left, right) = self.search(state, (*node).key());
                if right != self.tail && (*right).key() == (*node).key() {
                    // Key already present: refresh the live entry and
                    // recycle the node that lost the race to exist.
                    (*right).value().store((*node).value().load());
                    Node::drop_payload(node);
                    state.pool_mut().deallocate(block, layout);
                    return Ok(false);
                }
                (*node).set_next(right);
                if (*left).cas_next(right, node) {
                    return Ok(true);
                }
                backoff.spin();
            }
        }
    }

    /// Applies `f` to the stored value and writes the result back,
    /// returning the previous value.
    ///
    /// This is a load-compute-store at word granularity: a concurrent `put`
    /// or `update` on the same key between the load and the store wins or
    /// loses silently. Callers that need read-modify-write atomicity use
    /// [`OrderedList::update_strict`].
    pub(crate) fn update<U, F>(&self, state: &mut WorkerState<U>, key: &K, f: F) -> Option<V>
    where
        U: Upstream,
        F: FnOnce(V) -> V,
    {
        let (_, right) = self.search(state, key);
        // SAFETY: search contract; the value cell stays valid under the
        // epoch protocol even if the entry gets marked concurrently.
        unsafe {
            if right != self.tail && (*right).key() == key {
                let old = (*right).value().load();
                (*right).value().store(f(old));
                Some(old)
            } else {
                None
            }
        }
    }

    /// Compare-and-swap variant of [`OrderedList::update`]: `f` is re-run
    /// until the write lands on the value it was computed from.
    pub(crate) fn update_strict<U, F>(
        &self,
        state: &mut WorkerState<U>,
        key: &K,
        mut f: F,
    ) -> Option<V>
    where
        U: Upstream,
        V: Eq,
        F: FnMut(V) -> V,
    {
        let (_, right) = self.search(state, key);
        // SAFETY: search contract, as in `update`.
        unsafe {
            if right == self.tail || (*right).key() != key {
                return None;
            }
            let cell = (*right).value();
            let mut current = cell.load();
            loop {
                match cell.compare_exchange(current, f(current)) {
                    Ok(previous) => return Some(previous),
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Marks and unlinks `key`'s entry. Returns false when no live entry
    /// carries the key.
    pub(crate) fn erase<U: Upstream>(&self, state: &mut WorkerState<U>, key: &K) -> bool {
        let backoff = Backoff::new();
        // SAFETY: all pointers obey the search contract; right is only
        // deferred by whichever CAS physically unlinked it.
        unsafe {
            let mut left;
            let mut right;
            let right_next;
            loop {
                let window = self.search(state, key);
                left = window.0;
                right = window.1;
                if right == self.tail || (*right).key() != key {
                    return false;
                }
                let next = (*right).next_ptr();
                // Logical deletion: freeze the successor word with the mark.
                if !(*right).is_marked() && (*right).cas_mark(next) {
                    right_next = next;
                    break;
                }
                backoff.spin();
            }
            if (*left).cas_next(right, right_next) {
                let epoch = state.epochs().stamp();
                state.defer(
                    NonNull::new_unchecked(right.cast::<u8>()),
                    Node::<K, V>::layout(),
                    Node::<K, V>::drop_payload_erased,
                    epoch,
                );
            } else {
                // Someone moved left.next first; one more search lets the
                // concurrent sweep carry the marked node away. The logical
                // deletion already landed, so the erase still counts.
                let _ = self.search(state, key);
            }
            true
        }
    }
}

impl<K, V> Drop for OrderedList<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no concurrent access. Every node still
        // linked is exclusively owned here; excised nodes live in worker
        // queues and are not walked. Linked blocks were served by worker
        // pools over the process heap, so they return there directly.
        unsafe {
            let mut cursor = (*self.head).next_ptr();
            while cursor != self.tail {
                let next = (*cursor).next_ptr();
                Node::drop_payload(cursor);
                std::alloc::dealloc(cursor.cast::<u8>(), Node::<K, V>::layout());
                cursor = next;
            }
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}
