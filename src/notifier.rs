//! Memory usage notification.
//!
//! Heaps report every region they obtain from and return to the OS so that
//! an external policy can account for the memory overhead of instrumentation.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Observer of the memory a heap takes from and gives back to the OS.
///
/// Notifications are synchronous and cannot fail. A heap never takes its lock
/// in order to notify, but a caller holding it through [`Heap::lock`] or
/// [`Heap::guard`] still receives notifications under it. A notifier must not
/// assume anything about which thread calls it.
///
/// [`Heap::lock`]: crate::Heap::lock
/// [`Heap::guard`]: crate::Heap::guard
pub trait MemoryNotifier: Sync {
    /// `size` bytes at `base` were committed for use by a heap.
    fn notify_allocated(&self, base: NonNull<u8>, size: usize);

    /// `size` bytes at `base` were returned to the OS.
    fn notify_released(&self, base: NonNull<u8>, size: usize);
}

/// Ignores all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemoryNotifier;

impl MemoryNotifier for NullMemoryNotifier {
    #[inline]
    fn notify_allocated(&self, _base: NonNull<u8>, _size: usize) {}

    #[inline]
    fn notify_released(&self, _base: NonNull<u8>, _size: usize) {}
}

/// Keeps running totals of the notifications it receives.
#[derive(Debug, Default)]
pub struct CountingMemoryNotifier {
    allocated_bytes: AtomicUsize,
    released_bytes: AtomicUsize,
    allocation_count: AtomicUsize,
    release_count: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl CountingMemoryNotifier {
    /// Create a notifier with all counters at zero.
    pub const fn new() -> Self {
        Self {
            allocated_bytes: AtomicUsize::new(0),
            released_bytes: AtomicUsize::new(0),
            allocation_count: AtomicUsize::new(0),
            release_count: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        }
    }

    /// Total bytes ever reported as allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes ever reported as released.
    pub fn released_bytes(&self) -> usize {
        self.released_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated.
    ///
    /// Only exact once concurrent notifications have settled.
    pub fn in_use_bytes(&self) -> usize {
        self.allocated_bytes().saturating_sub(self.released_bytes())
    }

    /// The highest value [`in_use_bytes`](Self::in_use_bytes) was observed at.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Number of allocation notifications.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Number of release notifications.
    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::Relaxed)
    }
}

impl MemoryNotifier for CountingMemoryNotifier {
    fn notify_allocated(&self, _base: NonNull<u8>, size: usize) {
        let allocated = self.allocated_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        let in_use = allocated.saturating_sub(self.released_bytes.load(Ordering::Relaxed));
        self.peak_bytes.fetch_max(in_use, Ordering::Relaxed);
    }

    fn notify_released(&self, _base: NonNull<u8>, size: usize) {
        self.released_bytes.fetch_add(size, Ordering::Relaxed);
        self.release_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_notifier_tracks_usage() {
        let notifier = CountingMemoryNotifier::new();
        let base = NonNull::<u8>::dangling();

        notifier.notify_allocated(base, 4096);
        notifier.notify_allocated(base, 8192);
        assert_eq!(notifier.in_use_bytes(), 12288);
        assert_eq!(notifier.peak_bytes(), 12288);

        notifier.notify_released(base, 4096);
        assert_eq!(notifier.in_use_bytes(), 8192);
        assert_eq!(notifier.peak_bytes(), 12288);

        notifier.notify_allocated(base, 4096);
        notifier.notify_released(base, 12288);

        assert_eq!(notifier.allocated_bytes(), 16384);
        assert_eq!(notifier.released_bytes(), 16384);
        assert_eq!(notifier.in_use_bytes(), 0);
        assert_eq!(notifier.allocation_count(), 3);
        assert_eq!(notifier.release_count(), 2);
    }
}
