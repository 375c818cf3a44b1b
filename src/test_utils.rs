//! A fake [`PageSource`] that never touches the OS's virtual memory API.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::{BTreeSet, HashMap},
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::source::{PageSource, Protection};

pub const FAKE_PAGE_SIZE: usize = 4096;

/// Hands out page-aligned memory from the global allocator.
///
/// Panics if asked to release or protect anything it did not map,
/// so that tests catch a heap passing foreign addresses through.
#[derive(Debug, Default)]
pub struct FakePages {
    mapped: spin::Mutex<HashMap<usize, usize>>,
    no_access: spin::Mutex<BTreeSet<usize>>,
    fail_maps: AtomicUsize,
    map_count: AtomicUsize,
    unmap_count: AtomicUsize,
}

impl FakePages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `map` fail.
    pub fn fail_next_maps(&self, count: usize) {
        self.fail_maps.store(count, Ordering::SeqCst);
    }

    pub fn map_count(&self) -> usize {
        self.map_count.load(Ordering::SeqCst)
    }

    pub fn unmap_count(&self) -> usize {
        self.unmap_count.load(Ordering::SeqCst)
    }

    pub fn live_regions(&self) -> usize {
        self.mapped.lock().len()
    }

    pub fn is_mapped(&self, base: NonNull<u8>) -> bool {
        self.mapped.lock().contains_key(&(base.as_ptr() as usize))
    }

    /// The first page of every run of contiguous inaccessible pages, in address order.
    pub fn protected_pages(&self) -> Vec<NonNull<u8>> {
        let no_access = self.no_access.lock();
        let mut runs = Vec::new();
        let mut prev = None;

        for &page in no_access.iter() {
            if prev.map_or(true, |p| p + FAKE_PAGE_SIZE != page) {
                runs.push(NonNull::new(page as *mut u8).unwrap());
            }
            prev = Some(page);
        }

        runs
    }

    fn region_of(&self, addr: usize) -> Option<(usize, usize)> {
        self.mapped
            .lock()
            .iter()
            .map(|(&base, &size)| (base, size))
            .find(|&(base, size)| base <= addr && addr < base + size)
    }
}

unsafe impl PageSource for FakePages {
    fn page_size(&self) -> usize {
        FAKE_PAGE_SIZE
    }

    fn map(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        assert_eq!(size.get() % FAKE_PAGE_SIZE, 0, "mapping a partial page");

        let should_fail = self
            .fail_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if should_fail {
            return None;
        }

        let layout = Layout::from_size_align(size.get(), FAKE_PAGE_SIZE).ok()?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        let previous = self.mapped.lock().insert(base.as_ptr() as usize, size.get());
        assert!(previous.is_none(), "region mapped twice");
        self.map_count.fetch_add(1, Ordering::SeqCst);

        Some(base)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> bool {
        let addr = base.as_ptr() as usize;
        let mapped_size = self.mapped.lock().remove(&addr);

        match mapped_size {
            Some(mapped_size) => assert_eq!(mapped_size, size, "partial release of {addr:#x}"),
            None => panic!("released {addr:#x}, which was never mapped"),
        }

        self.no_access.lock().retain(|&page| page < addr || page >= addr + size);
        self.unmap_count.fetch_add(1, Ordering::SeqCst);

        unsafe { dealloc(base.as_ptr(), Layout::from_size_align_unchecked(size, FAKE_PAGE_SIZE)) };
        true
    }

    unsafe fn protect(&self, base: NonNull<u8>, size: usize, protection: Protection) -> bool {
        let addr = base.as_ptr() as usize;
        assert_eq!(addr % FAKE_PAGE_SIZE, 0);
        assert_eq!(size % FAKE_PAGE_SIZE, 0);

        let (region_base, region_size) = self
            .region_of(addr)
            .unwrap_or_else(|| panic!("protected {addr:#x}, which was never mapped"));
        assert!(addr + size <= region_base + region_size, "protection spans regions");

        let mut no_access = self.no_access.lock();
        for page in (addr..addr + size).step_by(FAKE_PAGE_SIZE) {
            match protection {
                Protection::NoAccess => no_access.insert(page),
                Protection::ReadWrite => no_access.remove(&page),
            };
        }

        true
    }
}

impl Drop for FakePages {
    fn drop(&mut self) {
        for (base, size) in self.mapped.get_mut().drain() {
            unsafe {
                dealloc(base as *mut u8, Layout::from_size_align_unchecked(size, FAKE_PAGE_SIZE))
            };
        }
    }
}
