//! Generic utilities for pointer handling and sizing.

use core::ptr::NonNull;

/// Aligns `size` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` if the result overflows.
#[inline]
pub const fn checked_align_up(size: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    match size.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Aligns `ptr` up to the next multiple of `align`, maintaining provenance.
///
/// `align` must be a power of two.
#[inline]
pub fn align_ptr_up(ptr: *mut u8, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());

    // this incantation maintains provenance of ptr
    // while allowing the compiler to see through the wrapping_add
    let aligned = (ptr as usize).wrapping_add(align - 1) & !(align - 1);
    ptr.wrapping_add(aligned.wrapping_sub(ptr as usize))
}

/// Aligns `ptr` down to a multiple of `align`, maintaining provenance.
///
/// `align` must be a power of two.
#[inline]
pub fn align_ptr_down(ptr: *mut u8, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());

    ptr.wrapping_sub(ptr as usize & (align - 1))
}

#[inline]
pub fn is_aligned_to(ptr: *const u8, align: usize) -> bool {
    (ptr as usize).trailing_zeros() >= align.trailing_zeros()
}

#[inline(always)]
pub fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `nn` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(nn.as_ptr(), len)) }
}
