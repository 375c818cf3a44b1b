use core::{num::NonZeroUsize, ptr::NonNull};

use crate::ptr_utils;

use super::{PageSource, Protection};

/// Pages from anonymous private `mmap`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixMMapPages;

impl UnixMMapPages {
    pub(super) fn query_page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        assert!(result > 0, "sysconf(_SC_PAGESIZE) failed");
        result as usize
    }
}

unsafe impl PageSource for UnixMMapPages {
    #[inline]
    fn page_size(&self) -> usize {
        super::page_size()
    }

    fn map(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        debug_assert_eq!(size.get() % self.page_size(), 0);

        // SAFETY: anonymous private mappings with a null hint don't alias anything
        let x = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size.get(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if x == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(x.cast())
    }

    #[inline]
    unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> bool {
        unsafe { libc::munmap(base.as_ptr().cast(), size) == 0 }
    }

    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> bool {
        debug_assert!(ptr_utils::is_aligned_to(base.as_ptr(), self.page_size()));
        debug_assert_eq!(size % self.page_size(), 0);

        let prot = match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        unsafe { libc::mprotect(base.as_ptr().cast(), size, prot) == 0 }
    }
}
