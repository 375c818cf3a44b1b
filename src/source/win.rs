use windows_sys::Win32::System::Memory::*;
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use core::{
    num::NonZeroUsize,
    ptr::{null, NonNull},
};

use crate::ptr_utils;

use super::{PageSource, Protection};

/// Pages from `VirtualAlloc` reservations committed in one go.
///
/// Regions are aligned to the allocation granularity (64KiB in practice),
/// which is stricter than the page size.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32VirtualAllocPages;

impl Win32VirtualAllocPages {
    pub(super) fn query_page_size() -> usize {
        // SAFETY: SYSTEM_INFO is plain data, GetSystemInfo fills it in
        let info = unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };

        info.dwPageSize as usize
    }
}

unsafe impl PageSource for Win32VirtualAllocPages {
    #[inline]
    fn page_size(&self) -> usize {
        super::page_size()
    }

    fn map(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        debug_assert_eq!(size.get() % self.page_size(), 0);

        let memory =
            unsafe { VirtualAlloc(null(), size.get(), MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };

        NonNull::new(memory.cast::<u8>())
    }

    #[inline]
    unsafe fn unmap(&self, base: NonNull<u8>, _size: usize) -> bool {
        // MEM_RELEASE requires a size of zero and frees the whole reservation
        unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) != 0 }
    }

    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> bool {
        debug_assert!(ptr_utils::is_aligned_to(base.as_ptr(), self.page_size()));
        debug_assert_eq!(size % self.page_size(), 0);

        let new_protect = match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadWrite => PAGE_READWRITE,
        };

        let mut old_protect = 0;
        unsafe { VirtualProtect(base.as_ptr().cast(), size, new_protect, &mut old_protect) != 0 }
    }
}
