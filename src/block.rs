//! Live guarded blocks.

use core::ptr::NonNull;

use crate::{
    layout::BlockLayout,
    ptr_utils::{self, nonnull_slice_from_raw_parts},
    source::{PageSource, Protection},
};

/// Which parts of a block are made inaccessible by [`BlockInfo::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockProtection {
    /// Everything is accessible.
    None,
    /// The whole pages covered by the redzones are inaccessible.
    Redzones,
    /// Every page of the block is inaccessible.
    All,
}

/// A live guarded allocation: its base address and layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    block: NonNull<u8>,
    layout: BlockLayout,
}

// SAFETY: a BlockInfo is a description of memory, not a handle to it
unsafe impl Send for BlockInfo {}
unsafe impl Sync for BlockInfo {}

impl BlockInfo {
    /// Describe the block at `block` laid out according to `layout`.
    pub fn new(block: NonNull<u8>, layout: BlockLayout) -> Self {
        debug_assert!(layout.is_consistent());
        debug_assert!(ptr_utils::is_aligned_to(block.as_ptr(), layout.block_alignment));

        Self { block, layout }
    }

    /// Base address of the block, as returned by the heap.
    #[inline]
    pub fn block(&self) -> NonNull<u8> {
        self.block
    }

    /// The geometry of the block.
    #[inline]
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Total size of the block.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    /// Address of the body handed to the instrumented program.
    #[inline]
    pub fn body(&self) -> NonNull<u8> {
        let body = self.block.as_ptr().wrapping_add(self.layout.body_offset());
        // SAFETY: the body lies within the block, so the pointer is non-null
        unsafe { NonNull::new_unchecked(body) }
    }

    /// Size of the body as requested.
    #[inline]
    pub fn body_size(&self) -> usize {
        self.layout.body_size
    }

    /// The whole block.
    pub fn span(&self) -> NonNull<[u8]> {
        nonnull_slice_from_raw_parts(self.block, self.layout.block_size)
    }

    /// The leading redzone.
    pub fn left_redzone(&self) -> NonNull<[u8]> {
        nonnull_slice_from_raw_parts(self.block, self.layout.left_redzone_size)
    }

    /// Everything after the body: the body padding and the trailing redzone.
    pub fn right_redzone(&self) -> NonNull<[u8]> {
        let base = self.body().as_ptr().wrapping_add(self.layout.body_size);
        let len = self.layout.body_padding_size + self.layout.right_redzone_size;

        // SAFETY: derived from the non-null body pointer within the block
        nonnull_slice_from_raw_parts(unsafe { NonNull::new_unchecked(base) }, len)
    }

    /// The whole pages lying entirely within the leading redzone.
    pub fn left_redzone_pages(&self, page_size: usize) -> NonNull<[u8]> {
        let start = ptr_utils::align_ptr_up(self.block.as_ptr(), page_size);
        let end = ptr_utils::align_ptr_down(self.body().as_ptr(), page_size);

        page_range(start, end)
    }

    /// The whole pages lying entirely within the body padding and trailing redzone.
    pub fn right_redzone_pages(&self, page_size: usize) -> NonNull<[u8]> {
        let body_end = self.body().as_ptr().wrapping_add(self.layout.body_size);
        let block_end = self.block.as_ptr().wrapping_add(self.layout.block_size);

        let start = ptr_utils::align_ptr_up(body_end, page_size);
        let end = ptr_utils::align_ptr_down(block_end, page_size);

        page_range(start, end)
    }

    /// Change the page protection of the block.
    ///
    /// Pages not covered by `protection` are made readable and writable.
    /// Returns `false` if any protection change was refused by the source.
    ///
    /// # Safety
    /// The block must be live and have been mapped by `source`. Nothing may
    /// access the pages made inaccessible until they are made accessible again.
    pub unsafe fn protect<S: PageSource + ?Sized>(
        &self,
        source: &S,
        protection: BlockProtection,
    ) -> bool {
        let page_size = source.page_size();
        let whole_block = page_range(
            ptr_utils::align_ptr_up(self.block.as_ptr(), page_size),
            ptr_utils::align_ptr_down(
                self.block.as_ptr().wrapping_add(self.layout.block_size),
                page_size,
            ),
        );

        unsafe {
            match protection {
                BlockProtection::None => change(source, whole_block, Protection::ReadWrite),
                BlockProtection::All => change(source, whole_block, Protection::NoAccess),
                BlockProtection::Redzones => {
                    // reset first, the previous state might have been `All`
                    change(source, whole_block, Protection::ReadWrite)
                        && change(source, self.left_redzone_pages(page_size), Protection::NoAccess)
                        && change(source, self.right_redzone_pages(page_size), Protection::NoAccess)
                }
            }
        }
    }
}

fn page_range(start: *mut u8, end: *mut u8) -> NonNull<[u8]> {
    let len = (end as usize).saturating_sub(start as usize);

    // SAFETY: `start` is derived from a non-null block base by rounding up
    nonnull_slice_from_raw_parts(unsafe { NonNull::new_unchecked(start) }, len)
}

unsafe fn change<S: PageSource + ?Sized>(
    source: &S,
    pages: NonNull<[u8]>,
    protection: Protection,
) -> bool {
    if pages.len() == 0 {
        return true;
    }

    unsafe { source.protect(pages.cast(), pages.len(), protection) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakePages, FAKE_PAGE_SIZE as PAGE};

    use core::num::NonZeroUsize;

    fn block_at(addr: usize, layout: BlockLayout) -> BlockInfo {
        BlockInfo::new(NonNull::new(addr as *mut u8).unwrap(), layout)
    }

    #[test]
    fn body_and_redzones_partition_the_block() {
        let layout = BlockLayout::plan(PAGE, 8, 100, PAGE, PAGE);
        let block = block_at(0x10_0000, layout);

        assert_eq!(block.body().as_ptr() as usize, 0x10_0000 + layout.left_redzone_size);
        assert_eq!(block.left_redzone().len(), layout.left_redzone_size);
        assert_eq!(
            block.right_redzone().as_ptr() as *mut u8 as usize,
            block.body().as_ptr() as usize + 100
        );
        assert_eq!(
            block.left_redzone().len() + block.body_size() + block.right_redzone().len(),
            block.block_size()
        );
        assert_eq!(block.span().len(), 3 * PAGE);
    }

    #[test]
    fn redzone_pages_are_whole_pages() {
        let layout = BlockLayout::plan(PAGE, 8, 100, PAGE, PAGE);
        let block = block_at(0x10_0000, layout);

        let left = block.left_redzone_pages(PAGE);
        assert_eq!(left.as_ptr() as *mut u8 as usize, 0x10_0000);
        assert_eq!(left.len(), PAGE);

        let right = block.right_redzone_pages(PAGE);
        assert_eq!(right.as_ptr() as *mut u8 as usize, 0x10_0000 + 2 * PAGE);
        assert_eq!(right.len(), PAGE);
    }

    #[test]
    fn redzone_pages_of_page_aligned_body() {
        let layout = BlockLayout::plan(PAGE, PAGE, 1, PAGE, PAGE);
        let block = block_at(0x20_0000, layout);

        assert_eq!(block.left_redzone_pages(PAGE).len(), PAGE);
        // the partially used body page is not a redzone page
        let right = block.right_redzone_pages(PAGE);
        assert_eq!(right.as_ptr() as *mut u8 as usize, 0x20_0000 + 2 * PAGE);
        assert_eq!(right.len(), PAGE);
    }

    #[test]
    fn protect_covers_redzone_pages() {
        let pages = FakePages::new();
        let layout = BlockLayout::plan(PAGE, 16, 3 * PAGE + 5, PAGE, PAGE);
        let base = pages.map(NonZeroUsize::new(layout.block_size).unwrap()).unwrap();
        let block = BlockInfo::new(base, layout);

        assert!(unsafe { block.protect(&pages, BlockProtection::Redzones) });
        assert_eq!(
            pages.protected_pages(),
            vec![
                block.left_redzone_pages(PAGE).cast::<u8>(),
                block.right_redzone_pages(PAGE).cast(),
            ]
        );

        assert!(unsafe { block.protect(&pages, BlockProtection::All) });
        assert_eq!(pages.protected_pages(), vec![base]);

        assert!(unsafe { block.protect(&pages, BlockProtection::None) });
        assert!(pages.protected_pages().is_empty());

        unsafe { pages.unmap(base, layout.block_size) };
    }
}
