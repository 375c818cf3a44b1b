//! An [`Allocator`] that places every allocation between guard pages.

use core::{fmt, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator, Layout};
use lock_api::RawMutex;

use crate::{
    block::{BlockInfo, BlockProtection},
    heap::Heap,
    large::{DefaultRawMutex, LargeBlockHeap},
    layout::BlockLayout,
    ptr_utils::nonnull_slice_from_raw_parts,
    source::PageSource,
};

/// Serves allocations as blocks of a [`LargeBlockHeap`] with inaccessible redzone pages.
///
/// Unlike [`Heap::allocate_block`], the body is only aligned as much as the
/// requested layout demands, which pushes it up against the trailing guard
/// page. Reading or writing past the end of an allocation faults on the
/// first byte beyond the layout's alignment padding.
///
/// Alignments greater than the page size are not supported.
///
/// # Example
/// ```rust
/// # use guardheap::*;
/// use allocator_api2::vec::Vec;
///
/// let heap = LargeBlockHeap::system(&NullMemoryNotifier);
/// let mut vec = Vec::new_in(GuardedAlloc::new(&heap));
/// vec.extend_from_slice(b"hello");
/// ```
pub struct GuardedAlloc<'h, 'n, S: PageSource, R: RawMutex = DefaultRawMutex> {
    heap: &'h LargeBlockHeap<'n, S, R>,
}

impl<'h, 'n, S: PageSource, R: RawMutex> GuardedAlloc<'h, 'n, S, R> {
    /// Allocate from `heap`.
    pub fn new(heap: &'h LargeBlockHeap<'n, S, R>) -> Self {
        Self { heap }
    }

    /// The heap backing this allocator.
    pub fn heap(&self) -> &'h LargeBlockHeap<'n, S, R> {
        self.heap
    }

    /// The block an allocation of `layout` occupies. Depends only on the
    /// layout and the page size, so deallocation can recover the block.
    fn plan(&self, layout: Layout) -> Option<BlockLayout> {
        let page_size = self.heap.page_size();

        if layout.align() > page_size {
            return None;
        }

        BlockLayout::try_plan(page_size, layout.align(), layout.size(), page_size, page_size)
    }
}

impl<S: PageSource, R: RawMutex> fmt::Debug for GuardedAlloc<'_, '_, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedAlloc")
            .field("page_size", &self.heap.page_size())
            .finish_non_exhaustive()
    }
}

impl<S: PageSource, R: RawMutex> Clone for GuardedAlloc<'_, '_, S, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: PageSource, R: RawMutex> Copy for GuardedAlloc<'_, '_, S, R> {}

unsafe impl<S: PageSource, R: RawMutex> Allocator for GuardedAlloc<'_, '_, S, R> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let block_layout = self.plan(layout).ok_or(AllocError)?;
        let base = self.heap.allocate(block_layout.block_size).ok_or(AllocError)?;
        let block = BlockInfo::new(base, block_layout);

        // SAFETY: the block was just allocated and nothing references it yet
        if !unsafe { self.heap.protect_block(&block, BlockProtection::Redzones) } {
            // SAFETY: as above
            unsafe { self.heap.free(base) };
            return Err(AllocError);
        }

        Ok(nonnull_slice_from_raw_parts(block.body(), layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // `ptr` came from `allocate` with `layout`, so planning cannot fail here
        let Some(block_layout) = self.plan(layout) else {
            return;
        };

        let base = ptr.as_ptr().wrapping_sub(block_layout.left_redzone_size);
        // SAFETY: the caller gives up `ptr`, the only reference into the block
        let freed = NonNull::new(base).is_some_and(|base| unsafe { self.heap.free(base) });

        debug_assert!(freed, "deallocated {ptr:p}, which is not a guarded allocation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notifier::NullMemoryNotifier,
        ptr_utils,
        test_utils::{FakePages, FAKE_PAGE_SIZE as PAGE},
    };

    #[test]
    fn body_abuts_the_trailing_guard_page() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);
        let alloc = GuardedAlloc::new(&heap);

        let layout = Layout::from_size_align(100, 8).unwrap();
        let body = alloc.allocate(layout).unwrap();
        let body_ptr = body.as_ptr() as *mut u8;

        assert_eq!(body.len(), 100);
        assert!(ptr_utils::is_aligned_to(body_ptr, 8));
        // 100 rounds up to 104 under 8 byte alignment
        assert!(ptr_utils::is_aligned_to(body_ptr.wrapping_add(104), PAGE));

        let base = ptr_utils::align_ptr_down(body_ptr, PAGE).wrapping_sub(PAGE);
        assert_eq!(heap.allocation_size(NonNull::new(base).unwrap()), Some(3 * PAGE));
        assert_eq!(
            heap.source().protected_pages(),
            vec![NonNull::new(base).unwrap(), NonNull::new(base.wrapping_add(2 * PAGE)).unwrap()]
        );

        unsafe {
            body_ptr.write_bytes(0xcd, 100);
            alloc.deallocate(body.cast(), layout);
        }

        assert!(heap.is_empty());
        assert!(heap.source().protected_pages().is_empty());
    }

    #[test]
    fn page_sized_alignment_is_supported() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);
        let alloc = GuardedAlloc::new(&heap);

        let layout = Layout::from_size_align(PAGE + 1, PAGE).unwrap();
        let body = alloc.allocate(layout).unwrap();
        assert!(ptr_utils::is_aligned_to(body.as_ptr() as *mut u8, PAGE));

        unsafe { alloc.deallocate(body.cast(), layout) };
        assert!(heap.is_empty());
    }

    #[test]
    fn over_aligned_layouts_fail() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);
        let alloc = GuardedAlloc::new(&heap);

        let layout = Layout::from_size_align(16, 2 * PAGE).unwrap();
        assert!(alloc.allocate(layout).is_err());
        assert_eq!(heap.source().map_count(), 0);
    }

    #[test]
    fn zero_sized_allocations_are_distinct() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);
        let alloc = GuardedAlloc::new(&heap);
        let layout = Layout::new::<()>();

        let a = alloc.allocate(layout).unwrap();
        let b = alloc.allocate(layout).unwrap();
        assert_ne!(a.as_ptr() as *mut u8, b.as_ptr() as *mut u8);

        unsafe {
            alloc.deallocate(a.cast(), layout);
            alloc.deallocate(b.cast(), layout);
        }
        assert!(heap.is_empty());
    }

    #[test]
    fn os_failure_is_an_alloc_error() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);
        let alloc = GuardedAlloc::new(&heap);

        heap.source().fail_next_maps(1);
        assert!(alloc.allocate(Layout::new::<u64>()).is_err());
        assert!(alloc.allocate(Layout::new::<u64>()).is_ok());
    }

    #[test]
    fn collections_grow_through_guarded_blocks() {
        let heap = LargeBlockHeap::new(FakePages::new(), &NullMemoryNotifier);

        {
            let mut vec = allocator_api2::vec::Vec::new_in(GuardedAlloc::new(&heap));
            for i in 0..10_000u32 {
                vec.push(i);
            }

            assert_eq!(heap.len(), 1);
            assert!(vec.iter().copied().eq(0..10_000));
        }

        assert!(heap.is_empty());
    }
}
