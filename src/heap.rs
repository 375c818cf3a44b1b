//! The contract shared by all heap backends.

use core::{fmt, marker::PhantomData, ptr::NonNull};

use crate::block::BlockInfo;

/// The state of the memory a heap hands out, as far as instrumentation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Allocations are carved out of a larger reservation which is already
    /// marked as reserved, and must be re-marked before use.
    Reserved,
    /// Allocations come straight from the OS and need no prior marking.
    Opaque,
}

/// A heap backend.
///
/// Every backend serves raw allocations, tracks which addresses it owns, and
/// layers guarded blocks on top of raw allocations.
///
/// [`free`](Heap::free) never passes an address it does not own to the OS:
/// freeing a foreign address returns `false` and has no effect.
pub trait Heap {
    /// The type of memory this heap returns. Constant for the lifetime of the heap.
    fn heap_type(&self) -> HeapType;

    /// Allocate at least `bytes` bytes.
    ///
    /// Every successful call returns an address distinct from all other live
    /// allocations of this heap, including when `bytes` is zero.
    /// Returns `None` if the OS cannot provide the memory.
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Free an allocation made by [`allocate`](Heap::allocate) on this heap.
    ///
    /// Returns `false` without releasing anything if `alloc` is not the
    /// base address of a live allocation of this heap.
    ///
    /// # Safety
    /// If `alloc` is a live allocation of this heap, nothing may reference its
    /// memory anymore. Freeing memory still owned by someone else, such as a
    /// collection backed by a [`GuardedAlloc`](crate::GuardedAlloc), unmaps it
    /// from under them.
    ///
    /// Foreign addresses are always safe to pass, they are refused.
    ///
    /// ```compile_fail
    /// # use guardheap::*;
    /// let heap = LargeBlockHeap::system(&NullMemoryNotifier);
    /// let alloc = heap.allocate(8).unwrap();
    /// heap.free(alloc);
    /// ```
    unsafe fn free(&self, alloc: NonNull<u8>) -> bool;

    /// Whether `alloc` is the base address of a live allocation of this heap.
    fn is_allocated(&self, alloc: NonNull<u8>) -> bool;

    /// The number of usable bytes of the live allocation at `alloc`, if known.
    fn allocation_size(&self, alloc: NonNull<u8>) -> Option<usize> {
        let _ = alloc;
        None
    }

    /// Acquire the heap's lock.
    ///
    /// The lock is reentrant: the holding thread may lock again, and may call
    /// any other method of the heap.
    fn lock(&self);

    /// Release the heap's lock.
    ///
    /// # Safety
    /// The current thread must hold the lock through a call to [`lock`](Heap::lock)
    /// that has not been matched by an `unlock` yet.
    unsafe fn unlock(&self);

    /// Acquire the heap's lock for the lifetime of the returned guard.
    fn guard(&self) -> HeapGuard<'_, Self>
    where
        Self: Sized,
    {
        self.lock();
        HeapGuard { heap: self, _not_send: PhantomData }
    }

    /// Plan a block around a body of `size` bytes and allocate it.
    ///
    /// The heap is free to use larger redzones than the given minimums.
    fn allocate_block(
        &self,
        size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockInfo>;

    /// Free a block allocated by [`allocate_block`](Heap::allocate_block).
    ///
    /// Same semantics as [`free`](Heap::free) applied to the block's base address.
    ///
    /// # Safety
    /// Nothing may still reference the block's memory.
    ///
    /// ```compile_fail
    /// # use guardheap::*;
    /// let heap = LargeBlockHeap::system(&NullMemoryNotifier);
    /// let block = heap.allocate_block(8, 0, 0).unwrap();
    /// heap.free_block(&block);
    /// ```
    unsafe fn free_block(&self, block: &BlockInfo) -> bool {
        // SAFETY: forwarded to the caller
        unsafe { self.free(block.block()) }
    }
}

/// Holds a [`Heap`]'s lock until dropped.
#[must_use = "if unused the heap will immediately unlock"]
pub struct HeapGuard<'a, H: Heap> {
    heap: &'a H,
    // the lock is owned by the locking thread
    _not_send: PhantomData<*const ()>,
}

impl<'a, H: Heap> HeapGuard<'a, H> {
    /// The locked heap.
    pub fn heap(&self) -> &'a H {
        self.heap
    }
}

impl<H: Heap> Drop for HeapGuard<'_, H> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by `Heap::guard`, which took the lock
        unsafe { self.heap.unlock() }
    }
}

impl<H: Heap> fmt::Debug for HeapGuard<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapGuard").finish_non_exhaustive()
    }
}
