//! Chain entry with a mark-carrying atomic successor pointer.
//!
//! The successor pointer and the logical-deletion mark share one atomic
//! word: bit 0 is the mark, the rest is the pointer. A marked node is
//! logically deleted; its successor word is frozen from then on, because
//! every compare-and-swap against `next` expects an unmarked word and fails
//! the moment the bit is set.

use core::alloc::Layout;
use core::mem;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::atomic::AtomicCell;

const MARK: usize = 1;

/// One key/value entry.
///
/// `key` and `value` stay uninitialized in the two sentinel nodes, exactly
/// like the mark word is the only live field of a sentinel. Real entries
/// write both fields once, before the node is linked; the key is immutable
/// from then on while the value cell stays writable.
pub(crate) struct Node<K, V> {
    key: MaybeUninit<K>,
    value: MaybeUninit<AtomicCell<V>>,
    next: AtomicUsize,
}

impl<K, V> Node<K, V> {
    /// The pool size class for entries of this type.
    pub(crate) fn layout() -> Layout {
        debug_assert!(mem::align_of::<Self>() >= 2, "no headroom for the mark bit");
        Layout::new::<Self>()
    }

    /// A node with only the successor word alive.
    pub(crate) fn sentinel() -> Self {
        Self {
            key: MaybeUninit::uninit(),
            value: MaybeUninit::uninit(),
            next: AtomicUsize::new(0),
        }
    }

    /// Writes a fresh unmarked entry into `block`.
    ///
    /// # Safety
    ///
    /// `block` must be valid for writes of `Node<K, V>` and exclusively
    /// owned by the caller.
    pub(crate) unsafe fn init(block: *mut Self, key: K, value: V) {
        unsafe {
            ptr::addr_of_mut!((*block).key).write(MaybeUninit::new(key));
            ptr::addr_of_mut!((*block).value).write(MaybeUninit::new(AtomicCell::new(value)));
            ptr::addr_of_mut!((*block).next).write(AtomicUsize::new(0));
        }
    }

    /// # Safety
    ///
    /// `self` must not be a sentinel.
    pub(crate) unsafe fn key(&self) -> &K {
        unsafe { self.key.assume_init_ref() }
    }

    /// # Safety
    ///
    /// `self` must not be a sentinel.
    pub(crate) unsafe fn value(&self) -> &AtomicCell<V> {
        unsafe { self.value.assume_init_ref() }
    }

    /// Successor pointer and mark bit, read as one word.
    #[inline]
    pub(crate) fn next_and_mark(&self) -> (*mut Self, bool) {
        let raw = self.next.load(Ordering::Acquire);
        ((raw & !MARK) as *mut Self, raw & MARK != 0)
    }

    /// Successor pointer with the mark stripped.
    #[inline]
    pub(crate) fn next_ptr(&self) -> *mut Self {
        self.next_and_mark().0
    }

    #[inline]
    pub(crate) fn is_marked(&self) -> bool {
        self.next.load(Ordering::Acquire) & MARK != 0
    }

    /// Plain successor publication; only valid while the node is unshared.
    #[inline]
    pub(crate) fn set_next(&self, next: *mut Self) {
        self.next.store(next as usize, Ordering::Release);
    }

    /// Swings the successor from `expected` to `new` if the node is still
    /// unmarked with exactly that successor.
    #[inline]
    pub(crate) fn cas_next(&self, expected: *mut Self, new: *mut Self) -> bool {
        self.next
            .compare_exchange(
                expected as usize,
                new as usize,
                Ordering::Release,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Sets the mark bit if the successor is still exactly `expected` and
    /// the node is unmarked.
    #[inline]
    pub(crate) fn cas_mark(&self, expected: *mut Self) -> bool {
        self.next
            .compare_exchange(
                expected as usize,
                expected as usize | MARK,
                Ordering::Release,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Drops the key and value in place without releasing the block.
    ///
    /// # Safety
    ///
    /// `node` must be a fully initialized (non-sentinel) entry that nothing
    /// can reach anymore; the payload is dropped exactly once.
    pub(crate) unsafe fn drop_payload(node: *mut Self) {
        unsafe {
            ptr::drop_in_place(ptr::addr_of_mut!((*node).key).cast::<K>());
            ptr::drop_in_place(ptr::addr_of_mut!((*node).value).cast::<AtomicCell<V>>());
        }
    }

    /// Type-erased form of [`Node::drop_payload`] for deferred-release
    /// entries, which outlive any place the node type is spelled.
    ///
    /// # Safety
    ///
    /// Same contract as `drop_payload`; `block` must point at a
    /// `Node<K, V>`.
    pub(crate) unsafe fn drop_payload_erased(block: *mut u8) {
        unsafe { Self::drop_payload(block.cast::<Self>()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_bit_travels_with_the_successor_word() {
        let a: Node<u64, u64> = Node::sentinel();
        let b = Box::into_raw(Box::new(Node::<u64, u64>::sentinel()));

        a.set_next(b);
        assert_eq!(a.next_and_mark(), (b, false));
        assert!(!a.is_marked());

        assert!(a.cas_mark(b));
        assert_eq!(a.next_and_mark(), (b, true));
        assert!(a.is_marked());

        // The word is frozen once marked: both CAS flavors expect unmarked.
        assert!(!a.cas_mark(b));
        assert!(!a.cas_next(b, core::ptr::null_mut()));
        assert_eq!(a.next_ptr(), b);

        // SAFETY: b came from Box::into_raw above.
        drop(unsafe { Box::from_raw(b) });
    }

    #[test]
    fn init_produces_an_unmarked_entry() {
        let mut slot = MaybeUninit::<Node<u32, u32>>::uninit();
        // SAFETY: slot is writable and exclusively owned.
        unsafe {
            Node::init(slot.as_mut_ptr(), 7, 70);
            let node = slot.assume_init_ref();
            assert_eq!(*node.key(), 7);
            assert_eq!(node.value().load(), 70);
            assert_eq!(node.next_and_mark(), (core::ptr::null_mut(), false));
            Node::drop_payload(slot.as_mut_ptr());
        }
    }
}
