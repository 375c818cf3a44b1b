//! Block layout planning.
//!
//! A block is laid out as follows:
//! ```text
//! | left redzone | body | body padding | right redzone |
//! ^ block base   ^ body base (aligned)
//! ```
//! The body is placed as close to the right redzone as its alignment allows,
//! which favours catching overflows over underflows when the redzones are
//! page-protected.

use crate::ptr_utils::checked_align_up;

/// The geometry of one guarded block.
///
/// Produced by [`BlockLayout::plan`]. The sizes always satisfy
/// `block_size == left_redzone_size + body_size + body_padding_size + right_redzone_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLayout {
    /// The alignment of the whole block, also its size granularity.
    pub block_alignment: usize,
    /// The total size of the block.
    pub block_size: usize,
    /// The alignment of the body.
    pub body_alignment: usize,
    /// The size of the leading redzone. Always a multiple of `body_alignment`.
    pub left_redzone_size: usize,
    /// The exact size requested for the body.
    pub body_size: usize,
    /// Slack between the end of the body and the start of the right redzone.
    pub body_padding_size: usize,
    /// The size of the trailing redzone.
    pub right_redzone_size: usize,
}

impl BlockLayout {
    /// Plans the layout of a block.
    ///
    /// - `chunk_size`: the block size is rounded up to a multiple of this, and the
    ///   block is expected to be allocated at this alignment.
    /// - `alignment`: the alignment of the body.
    /// - `size`: the size of the body.
    /// - `min_left_redzone` and `min_right_redzone`: lower bounds for the redzones.
    ///
    /// `chunk_size` and `alignment` must be powers of two, `alignment <= chunk_size`.
    ///
    /// # Panics
    /// Panics if the preconditions are violated or if the block size is not
    /// representable in a `usize`.
    #[track_caller]
    pub fn plan(
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Self {
        match Self::try_plan(chunk_size, alignment, size, min_left_redzone, min_right_redzone) {
            Some(layout) => layout,
            None => layout_overflow(size),
        }
    }

    /// Like [`BlockLayout::plan`], but returns `None` instead of panicking if
    /// the block size overflows.
    ///
    /// # Panics
    /// Panics if `chunk_size` or `alignment` are not powers of two, or if
    /// `alignment > chunk_size`.
    #[track_caller]
    pub fn try_plan(
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<Self> {
        assert!(chunk_size.is_power_of_two(), "chunk size must be a power of two");
        assert!(alignment.is_power_of_two(), "body alignment must be a power of two");
        assert!(alignment <= chunk_size, "body alignment exceeds chunk size");

        let left_redzone_size = checked_align_up(min_left_redzone, alignment)?;
        let right_redzone_size = min_right_redzone;

        let unaligned_size =
            left_redzone_size.checked_add(size)?.checked_add(right_redzone_size)?;
        let block_size = checked_align_up(unaligned_size, chunk_size)?;

        // Push the body up against the right redzone. Whatever is left over at
        // the front goes to the left redzone.
        let body_and_right = size + right_redzone_size;
        let body_and_right_aligned = checked_align_up(body_and_right, alignment)?;
        let body_padding_size = body_and_right_aligned - body_and_right;
        let left_redzone_size = block_size - body_and_right_aligned;

        let layout = Self {
            block_alignment: chunk_size,
            block_size,
            body_alignment: alignment,
            left_redzone_size,
            body_size: size,
            body_padding_size,
            right_redzone_size,
        };

        debug_assert!(min_left_redzone <= layout.left_redzone_size);
        debug_assert!(min_right_redzone <= layout.right_redzone_size);
        debug_assert_eq!(layout.block_size % chunk_size, 0);
        debug_assert_eq!(layout.left_redzone_size % alignment, 0);
        debug_assert!(layout.is_consistent());

        Some(layout)
    }

    /// The size of the body rounded up so that the right redzone starts at
    /// `body_alignment`, i.e. `body_size + body_padding_size`.
    #[inline]
    pub const fn body_size_aligned(&self) -> usize {
        self.body_size + self.body_padding_size
    }

    /// The offset of the body from the block base.
    #[inline]
    pub const fn body_offset(&self) -> usize {
        self.left_redzone_size
    }

    /// The offset of the right redzone from the block base.
    #[inline]
    pub const fn right_redzone_offset(&self) -> usize {
        self.left_redzone_size + self.body_size_aligned()
    }

    /// Whether the component sizes add up to the block size.
    pub fn is_consistent(&self) -> bool {
        self.left_redzone_size
            .checked_add(self.body_size_aligned())
            .and_then(|s| s.checked_add(self.right_redzone_size))
            == Some(self.block_size)
    }
}

#[cold]
#[track_caller]
fn layout_overflow(size: usize) -> ! {
    panic!("block layout for a body of {size:#x} bytes overflows the address space")
}
