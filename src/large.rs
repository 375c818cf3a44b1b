//! A heap that serves every allocation directly from the OS.

use core::{cell::RefCell, fmt, mem, num::NonZeroUsize, ptr::NonNull};
use std::collections::HashMap;

use lock_api::{RawMutex, ReentrantMutex};
use parking_lot::RawThreadId;

use crate::{
    block::{BlockInfo, BlockProtection},
    heap::{Heap, HeapType},
    layout::BlockLayout,
    notifier::MemoryNotifier,
    ptr_utils,
    source::PageSource,
};

#[cfg(all(feature = "system-backed", any(unix, windows)))]
use crate::source::SystemPages;

/// The raw mutex used by [`LargeBlockHeap`] unless another is chosen.
pub type DefaultRawMutex = parking_lot::RawMutex;

/// A [`LargeBlockHeap`] backed by the operating system.
#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub type SystemLargeBlockHeap<'n> = LargeBlockHeap<'n, SystemPages>;

/// Live allocations, base address to mapped size.
type Allocations = RefCell<HashMap<usize, usize>>;

/// A heap that maps fresh pages for every allocation.
///
/// Blocks are bracketed by whole guard pages instead of byte-granular
/// redzones, so the per-block overhead is two pages. This pays off for large
/// allocations, and lets overflows be caught by page faults once the
/// redzones are protected (see [`LargeBlockHeap::protect_block`]).
///
/// Memory is returned zeroed, hence the heap is [`HeapType::Opaque`].
///
/// The heap records every address it hands out and refuses to release
/// anything else. The lock guarding that record is reentrant, and is only
/// held for the bookkeeping, never across a map or unmap.
pub struct LargeBlockHeap<'n, S: PageSource, R: RawMutex = DefaultRawMutex> {
    source: S,
    notifier: &'n dyn MemoryNotifier,
    allocs: ReentrantMutex<R, RawThreadId, Allocations>,
}

impl<'n, S: PageSource> LargeBlockHeap<'n, S> {
    /// Create a heap taking pages from `source` and reporting to `notifier`.
    pub fn new(source: S, notifier: &'n dyn MemoryNotifier) -> Self {
        Self::with_lock(source, notifier)
    }
}

#[cfg(all(feature = "system-backed", any(unix, windows)))]
impl<'n> LargeBlockHeap<'n, SystemPages> {
    /// Create a heap taking pages from the OS and reporting to `notifier`.
    pub fn system(notifier: &'n dyn MemoryNotifier) -> Self {
        Self::new(SystemPages, notifier)
    }
}

impl<'n, S: PageSource, R: RawMutex> LargeBlockHeap<'n, S, R> {
    /// Create a heap using `R` as the underlying lock.
    ///
    /// # Example
    /// ```rust
    /// # use guardheap::*;
    /// let heap =
    ///     LargeBlockHeap::<_, spin::Mutex<()>>::with_lock(SystemPages, &NullMemoryNotifier);
    /// ```
    pub fn with_lock(source: S, notifier: &'n dyn MemoryNotifier) -> Self {
        assert!(source.page_size().is_power_of_two());

        Self { source, notifier, allocs: ReentrantMutex::new(RefCell::new(HashMap::new())) }
    }

    /// The source this heap maps pages from.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The granularity of every allocation.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    /// The number of live allocations.
    pub fn len(&self) -> usize {
        self.allocs.lock().borrow().len()
    }

    /// Whether there are no live allocations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the base addresses of all live allocations, in no particular order.
    pub fn allocations(&self) -> Vec<NonNull<u8>> {
        self.allocs
            .lock()
            .borrow()
            .keys()
            .filter_map(|&base| NonNull::new(base as *mut u8))
            .collect()
    }

    /// Change the page protection of a live block of this heap.
    ///
    /// Returns `false` if the block is not a live block of this heap or if
    /// the OS refused. The heap lock is held throughout, so the block
    /// cannot be freed concurrently.
    ///
    /// # Safety
    /// Nothing may access the block's inaccessible pages until they are made
    /// accessible again. In particular the block must not belong to anyone
    /// still using it, such as a collection backed by a
    /// [`GuardedAlloc`](crate::GuardedAlloc). The heap itself never touches
    /// the contents of its blocks.
    ///
    /// ```compile_fail
    /// # use guardheap::*;
    /// let heap = LargeBlockHeap::system(&NullMemoryNotifier);
    /// let block = heap.allocate_block(8, 0, 0).unwrap();
    /// heap.protect_block(&block, BlockProtection::All);
    /// ```
    pub unsafe fn protect_block(&self, block: &BlockInfo, protection: BlockProtection) -> bool {
        let allocs = self.allocs.lock();

        let owned = allocs
            .borrow()
            .get(&(block.block().as_ptr() as usize))
            .is_some_and(|&size| block.block_size() <= size);

        if !owned {
            drop(allocs);
            log::debug!("refusing to protect {:p}, not a block of this heap", block.block());
            return false;
        }

        // SAFETY: the block is live and was mapped by `source`, and cannot be
        // released while the lock is held
        let protected = unsafe { block.protect(&self.source, protection) };
        drop(allocs);

        if !protected {
            log::warn!("failed to set {:?} protection on block {:p}", protection, block.block());
        }

        protected
    }

    /// Unmap a region whose ownership has already been dropped.
    fn release(&self, alloc: NonNull<u8>, size: usize) {
        // SAFETY: `alloc` was mapped by `source` with this size and has just
        // been removed from the live set, so nobody else will release it
        if !unsafe { self.source.unmap(alloc, size) } {
            // the region can't be put back into a consistent state
            log::error!("failed to release {size:#x} bytes at {alloc:p}");
            std::process::abort();
        }

        log::trace!("released {size:#x} bytes at {alloc:p}");
        self.notifier.notify_released(alloc, size);
    }
}

impl<S: PageSource, R: RawMutex> Heap for LargeBlockHeap<'_, S, R> {
    #[inline]
    fn heap_type(&self) -> HeapType {
        // Allocations don't come out of a reservation, so there's nothing to
        // gain from marking them reserved first.
        HeapType::Opaque
    }

    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        // always map something so that zero-sized allocations get distinct addresses
        let size = ptr_utils::checked_align_up(bytes.max(1), self.page_size())?;
        let size = NonZeroUsize::new(size)?;

        let Some(alloc) = self.source.map(size) else {
            log::trace!("failed to map {:#x} bytes", size);
            return None;
        };

        let previous = self.allocs.lock().borrow_mut().insert(alloc.as_ptr() as usize, size.get());
        assert!(previous.is_none(), "the OS handed out {alloc:p} twice");

        log::trace!("mapped {:#x} bytes at {:p}", size, alloc);
        self.notifier.notify_allocated(alloc, size.get());

        Some(alloc)
    }

    unsafe fn free(&self, alloc: NonNull<u8>) -> bool {
        let size = self.allocs.lock().borrow_mut().remove(&(alloc.as_ptr() as usize));

        let Some(size) = size else {
            log::debug!("refusing to free {:p}, not allocated by this heap", alloc);
            return false;
        };

        self.release(alloc, size);
        true
    }

    fn is_allocated(&self, alloc: NonNull<u8>) -> bool {
        self.allocs.lock().borrow().contains_key(&(alloc.as_ptr() as usize))
    }

    fn allocation_size(&self, alloc: NonNull<u8>) -> Option<usize> {
        self.allocs.lock().borrow().get(&(alloc.as_ptr() as usize)).copied()
    }

    fn lock(&self) {
        mem::forget(self.allocs.lock());
    }

    unsafe fn unlock(&self) {
        // SAFETY: the caller holds a guard leaked by `lock`
        unsafe { self.allocs.force_unlock() }
    }

    fn allocate_block(
        &self,
        size: usize,
        _min_left_redzone: usize,
        _min_right_redzone: usize,
    ) -> Option<BlockInfo> {
        let page_size = self.page_size();

        // whole guard pages, whatever the requested minimums
        let layout = BlockLayout::plan(page_size, page_size, size, page_size, page_size);
        debug_assert_eq!(layout.block_size % page_size, 0);

        let block = self.allocate(layout.block_size)?;
        Some(BlockInfo::new(block, layout))
    }
}

impl<S: PageSource, R: RawMutex> Drop for LargeBlockHeap<'_, S, R> {
    fn drop(&mut self) {
        // no locking required, having `&mut self` means nobody else has access
        let allocs = mem::take(self.allocs.get_mut().get_mut());

        for (base, size) in allocs {
            if let Some(base) = NonNull::new(base as *mut u8) {
                self.release(base, size);
            }
        }
    }
}

impl<S: PageSource + fmt::Debug, R: RawMutex> fmt::Debug for LargeBlockHeap<'_, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("LargeBlockHeap");
        d.field("source", &self.source);

        match self.allocs.try_lock() {
            Some(allocs) => match allocs.try_borrow() {
                Ok(allocs) => d.field("live_allocations", &allocs.len()),
                Err(_) => d.field("live_allocations", &format_args!("<borrowed>")),
            },
            None => d.field("live_allocations", &format_args!("<locked>")),
        };

        d.finish_non_exhaustive()
    }
}
