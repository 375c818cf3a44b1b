//! Guarded heap backends for memory-safety instrumentation.
//!
//! Every heap implements [`Heap`]: raw allocation and ownership-checked
//! freeing, an explicit reentrant lock, and guarded blocks planned by
//! [`BlockLayout::plan`], where a body is surrounded by redzones.
//!
//! [`LargeBlockHeap`] maps fresh pages for every allocation and uses whole
//! pages as redzones, so that overflows can be caught by page faults.
//! Its pages come from a [`PageSource`] (the OS by default, see
//! [`SystemPages`]) and every region is reported to a [`MemoryNotifier`].
//!
//! ```rust
//! # use guardheap::*;
//! let notifier = CountingMemoryNotifier::new();
//! let heap = LargeBlockHeap::system(&notifier);
//!
//! let block = heap.allocate_block(100, 0, 0).unwrap();
//! assert!(unsafe { heap.protect_block(&block, BlockProtection::Redzones) });
//! unsafe { block.body().as_ptr().write_bytes(0, block.body_size()) };
//!
//! assert!(unsafe { heap.free_block(&block) });
//! assert!(!unsafe { heap.free_block(&block) });
//! assert_eq!(notifier.in_use_bytes(), 0);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]

#[cfg(test)]
mod test_utils;
pub(crate) mod ptr_utils;

mod block;
mod heap;
mod large;
mod layout;

pub mod notifier;
pub mod source;

#[cfg(feature = "allocator-api2")]
mod guarded;

pub use block::{BlockInfo, BlockProtection};
pub use heap::{Heap, HeapGuard, HeapType};
pub use large::{DefaultRawMutex, LargeBlockHeap};
pub use layout::BlockLayout;
pub use notifier::{CountingMemoryNotifier, MemoryNotifier, NullMemoryNotifier};
pub use source::{PageSource, Protection};

#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub use large::SystemLargeBlockHeap;
#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub use source::{page_size, SystemPages};

#[cfg(feature = "allocator-api2")]
pub use guarded::GuardedAlloc;
