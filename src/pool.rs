//! Single-size-class freelist allocation over an upstream byte source.
//!
//! A [`BlockPool`] recycles blocks of one fixed layout. Returned blocks are
//! threaded onto a LIFO freelist through separate link cells rather than
//! through the block payload: a block handed back to the pool may still be
//! read by a concurrent chain walker until the safe epoch passes it, so the
//! pool must not scribble over it. Link cells live in a parallel freelist of
//! their own and are recycled alongside the blocks they once carried.
//!
//! Pools are strictly thread-local. Every method takes `&mut self` and no
//! field is atomic; a worker owns exactly one pool and never lends it out.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr;
use core::ptr::NonNull;

use crate::errors::Error;

/// Capability set of an upstream byte source.
///
/// Mirrors the classic memory-resource contract: `deallocate` must receive
/// exactly the pointer and layout an earlier `allocate` produced. Identity
/// comparison is `PartialEq` on the pool that wraps the resource. No thread
/// safety is required; each pool (and therefore each upstream) stays on one
/// thread.
pub trait Upstream {
    /// Obtains a fresh block. Failure is reported, never recovered.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error>;

    /// Returns a block obtained from [`Upstream::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior `allocate` on the same resource with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Upstream over the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Heap;

impl Upstream for Heap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout is non-zero-sized.
        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(Error::AllocExhausted { size: layout.size() })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller passes a block from `allocate` with its layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Bounded monotonic upstream over an owned buffer.
///
/// Allocation bumps a cursor; `deallocate` is a no-op and the whole buffer
/// is recovered when the arena drops. Exhaustion surfaces as
/// [`Error::AllocExhausted`], which makes allocator failure paths testable
/// without exhausting the real heap.
pub struct FixedArena {
    base: NonNull<u8>,
    capacity: usize,
    cursor: Cell<usize>,
    backing: Layout,
}

// SAFETY: the arena exclusively owns its buffer; moving it to another thread
// moves the buffer with it.
unsafe impl Send for FixedArena {}

impl FixedArena {
    /// Creates an arena holding `capacity` bytes. `capacity` must be nonzero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "an arena needs at least one byte");
        let backing = match Layout::from_size_align(capacity, 16) {
            Ok(layout) => layout,
            Err(_) => panic!("arena capacity overflows a layout"),
        };
        // SAFETY: backing is non-zero-sized.
        let raw = unsafe { std::alloc::alloc(backing) };
        let base = match NonNull::new(raw) {
            Some(base) => base,
            None => std::alloc::handle_alloc_error(backing),
        };
        Self {
            base,
            capacity,
            cursor: Cell::new(0),
            backing,
        }
    }
}

impl Upstream for FixedArena {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let exhausted = Error::AllocExhausted {
            size: layout.size(),
        };
        let addr = self.base.as_ptr() as usize + self.cursor.get();
        let aligned = match addr.checked_add(layout.align() - 1) {
            Some(a) => a & !(layout.align() - 1),
            None => return Err(exhausted),
        };
        let offset = aligned - self.base.as_ptr() as usize;
        let end = match offset.checked_add(layout.size()) {
            Some(e) => e,
            None => return Err(exhausted),
        };
        if end > self.capacity {
            return Err(exhausted);
        }
        self.cursor.set(end);
        // SAFETY: offset is within the live buffer.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Monotonic: storage is recovered wholesale when the arena drops.
    }
}

impl Drop for FixedArena {
    fn drop(&mut self) {
        // SAFETY: base was allocated in `new` with `backing`.
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.backing) }
    }
}

/// One cell of the block freelist. Lives outside the block it carries.
struct Link {
    block: *mut u8,
    next: *mut Link,
}

/// Observable pool counters. Purely informational.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks fetched from the upstream resource.
    pub upstream_blocks: u64,
    /// Blocks served from the freelist.
    pub reused_blocks: u64,
    /// Blocks handed back through `deallocate`.
    pub returned_blocks: u64,
    /// Link cells fetched from the upstream resource.
    pub link_cells: u64,
    /// Blocks returned straight upstream because no link cell was available.
    pub bypassed_blocks: u64,
}

/// Thread-local fixed-size-class allocator over an [`Upstream`] source.
///
/// The size class is fixed at construction; every `allocate` and
/// `deallocate` must use exactly that layout (debug-checked). Freed blocks
/// are reused most-recent-first.
pub struct BlockPool<U: Upstream = Heap> {
    upstream: U,
    class: Layout,
    free_blocks: *mut Link,
    spare_links: *mut Link,
    stats: PoolStats,
}

impl<U: Upstream> BlockPool<U> {
    /// Creates a pool serving blocks of layout `class`.
    pub fn new(upstream: U, class: Layout) -> Self {
        assert!(class.size() > 0, "the size class must be nonzero");
        Self {
            upstream,
            class,
            free_blocks: ptr::null_mut(),
            spare_links: ptr::null_mut(),
            stats: PoolStats::default(),
        }
    }

    /// The size class fixed at construction.
    pub fn class(&self) -> Layout {
        self.class
    }

    /// A snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Serves one block of the pool's size class.
    ///
    /// Reuses the most recently returned block when one is available,
    /// otherwise forwards to the upstream resource and surfaces its failure
    /// unchanged.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        debug_assert_eq!(layout, self.class, "pool serves a single size class");
        if self.free_blocks.is_null() {
            let block = self.upstream.allocate(self.class)?;
            self.stats.upstream_blocks += 1;
            return Ok(block);
        }
        // SAFETY: non-null entries of `free_blocks` are live link cells owned
        // by this pool, each carrying a previously returned block.
        unsafe {
            let link = self.free_blocks;
            self.free_blocks = (*link).next;
            let block = (*link).block;
            (*link).next = self.spare_links;
            self.spare_links = link;
            self.stats.reused_blocks += 1;
            Ok(NonNull::new_unchecked(block))
        }
    }

    /// Returns a block to the pool.
    ///
    /// Needs one link cell, taken from the spare list or from upstream. If
    /// the upstream cannot produce one, the block goes straight back
    /// upstream instead of joining the freelist.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior [`BlockPool::allocate`] on this pool (or
    /// a pool over the same upstream with the same class) and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert_eq!(layout, self.class, "pool serves a single size class");
        let link = match self.take_link() {
            Some(link) => link,
            None => {
                self.stats.bypassed_blocks += 1;
                // SAFETY: caller contract; the block originated upstream.
                unsafe { self.upstream.deallocate(ptr, self.class) };
                return;
            }
        };
        // SAFETY: link points at a live cell owned by this pool.
        unsafe {
            (*link.as_ptr()).block = ptr.as_ptr();
            (*link.as_ptr()).next = self.free_blocks;
            self.free_blocks = link.as_ptr();
        }
        self.stats.returned_blocks += 1;
    }

    fn take_link(&mut self) -> Option<NonNull<Link>> {
        if !self.spare_links.is_null() {
            // SAFETY: non-null spare links are live cells owned by this pool.
            unsafe {
                let link = self.spare_links;
                self.spare_links = (*link).next;
                return Some(NonNull::new_unchecked(link));
            }
        }
        let raw = self.upstream.allocate(Layout::new::<Link>()).ok()?;
        self.stats.link_cells += 1;
        Some(raw.cast())
    }
}

impl<U: Upstream> PartialEq for BlockPool<U> {
    /// Identity comparison: a pool only equals itself.
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<U: Upstream> Drop for BlockPool<U> {
    fn drop(&mut self) {
        // SAFETY: every list entry was produced by this pool's upstream with
        // the layout recorded here, and nothing else references them.
        unsafe {
            let mut link = self.free_blocks;
            while !link.is_null() {
                let next = (*link).next;
                if let Some(block) = NonNull::new((*link).block) {
                    self.upstream.deallocate(block, self.class);
                }
                self.upstream
                    .deallocate(NonNull::new_unchecked(link.cast()), Layout::new::<Link>());
                link = next;
            }
            let mut link = self.spare_links;
            while !link.is_null() {
                let next = (*link).next;
                self.upstream
                    .deallocate(NonNull::new_unchecked(link.cast()), Layout::new::<Link>());
                link = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> Layout {
        Layout::from_size_align(500, 8).unwrap()
    }

    #[test]
    fn arena_exhaustion_surfaces() {
        let arena = FixedArena::new(1300);
        let first = arena.allocate(class()).unwrap();
        let _second = arena.allocate(class()).unwrap();
        assert!(matches!(
            arena.allocate(class()),
            Err(Error::AllocExhausted { size: 500 })
        ));
        assert_eq!(first.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn pool_reuses_blocks_lifo() {
        let mut pool = BlockPool::new(FixedArena::new(1300), class());
        let p1 = pool.allocate(class()).unwrap();
        let p2 = pool.allocate(class()).unwrap();
        assert!(matches!(
            pool.allocate(class()),
            Err(Error::AllocExhausted { .. })
        ));

        unsafe {
            pool.deallocate(p1, class());
            pool.deallocate(p2, class());
        }
        for _ in 0..100 {
            let a = pool.allocate(class()).unwrap();
            let b = pool.allocate(class()).unwrap();
            assert_eq!(a, p2, "most recently returned block comes back first");
            assert_eq!(b, p1);
            unsafe {
                pool.deallocate(b, class());
                pool.deallocate(a, class());
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.upstream_blocks, 2);
        assert_eq!(stats.reused_blocks, 200);
        assert_eq!(stats.returned_blocks, 202);
        assert_eq!(stats.link_cells, 2, "link cells are recycled");
        assert_eq!(stats.bypassed_blocks, 0);
    }

    #[test]
    fn heap_pool_balanced_round_trip() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let mut pool = BlockPool::new(Heap, layout);
        let mut live = Vec::new();
        for _ in 0..16 {
            live.push(pool.allocate(layout).unwrap());
        }
        for ptr in live.drain(..) {
            unsafe { pool.deallocate(ptr, layout) };
        }
        assert_eq!(pool.stats().upstream_blocks, 16);
        assert_eq!(pool.stats().returned_blocks, 16);
        // Drop returns the 16 pooled blocks and their links upstream.
    }

    #[test]
    fn pools_compare_by_identity() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let a = BlockPool::new(Heap, layout);
        let b = BlockPool::new(Heap, layout);
        let a_ref = &a;
        assert!(a_ref == a_ref);
        assert!(a != b);
    }
}
