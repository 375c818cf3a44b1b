//! Platform memory: mapping, releasing, and protecting whole pages.
//!
//! [`PageSource`] is the seam between the heaps and the operating system.
//! [`SystemPages`] is the real implementation when the `system-backed`
//! feature is enabled.

use core::{num::NonZeroUsize, ptr::NonNull};

#[cfg(all(feature = "system-backed", target_family = "unix"))]
mod unix;
#[cfg(all(feature = "system-backed", target_family = "windows"))]
mod win;

#[cfg(all(feature = "system-backed", target_family = "unix"))]
pub use unix::UnixMMapPages as SystemPages;

#[cfg(all(feature = "system-backed", target_family = "windows"))]
pub use win::Win32VirtualAllocPages as SystemPages;

/// Access rights for a range of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults.
    NoAccess,
    /// Readable and writable.
    ReadWrite,
}

/// A source of freshly committed, page-granular memory.
///
/// # Safety
/// Implementors must uphold the following:
/// - [`map`](PageSource::map) returns regions aligned to [`page_size`](PageSource::page_size),
///   zero-initialized, readable and writable, and not overlapping any other
///   live region handed out by any source.
/// - [`page_size`](PageSource::page_size) is a power of two and never changes.
pub unsafe trait PageSource {
    /// The granularity of mapping and protection.
    fn page_size(&self) -> usize;

    /// Maps at least `size` bytes. `size` is a multiple of the page size.
    ///
    /// Returns `None` if the OS cannot satisfy the request.
    fn map(&self, size: NonZeroUsize) -> Option<NonNull<u8>>;

    /// Releases a whole region previously returned by [`map`](PageSource::map).
    ///
    /// Returns `false` if the OS refused.
    ///
    /// # Safety
    /// `base` and `size` must describe exactly one live region returned by `map`
    /// on this source. Nothing may access the region afterwards.
    unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> bool;

    /// Changes the access rights of whole pages within a mapped region.
    ///
    /// Returns `false` if the OS refused.
    ///
    /// # Safety
    /// `base..base + size` must be page-aligned and lie within one live region
    /// returned by `map` on this source.
    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> bool;
}

unsafe impl<S: PageSource + ?Sized> PageSource for &S {
    #[inline]
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    #[inline]
    fn map(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        (**self).map(size)
    }

    #[inline]
    unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> bool {
        unsafe { (**self).unmap(base, size) }
    }

    #[inline]
    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> bool {
        unsafe { (**self).protect(base, size, protection) }
    }
}

/// The page size of the running system, queried once.
#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub fn page_size() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = SystemPages::query_page_size();
            assert!(page_size.is_power_of_two(), "OS page size is not a power of two");
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}
