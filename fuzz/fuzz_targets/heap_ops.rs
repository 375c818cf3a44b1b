#![no_main]

use std::ptr::NonNull;

use allocator_api2::alloc::{Allocator, Layout};
use guardheap::*;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate `size` raw bytes
    Alloc { size: u16 },
    /// Allocate a block around a body of `size` bytes
    AllocBlock { size: u16, protect: bool },
    /// Allocate through the guarded allocator with align of 1 << (align_bit % 12)
    AllocGuarded { size: u16, align_bit: u8 },
    /// Free the ith allocation
    Free { index: u8 },
    /// Free an address `offset` bytes into the ith allocation
    FreeInterior { index: u8, offset: u16 },
    /// Free the ith allocation twice
    DoubleFree { index: u8 },
}
use Actions::*;

enum Live {
    Raw(NonNull<u8>, usize),
    Block(BlockInfo),
    Guarded(NonNull<u8>, Layout),
}

fuzz_target!(|actions: Vec<Actions>| {
    let notifier = CountingMemoryNotifier::new();
    let heap = LargeBlockHeap::system(&notifier);
    let guarded = GuardedAlloc::new(&heap);

    let mut live: Vec<Live> = vec![];

    for action in actions {
        match action {
            Alloc { size } => {
                if let Some(alloc) = heap.allocate(size as usize) {
                    unsafe { alloc.as_ptr().write_bytes(0xab, size as usize) };
                    assert!(heap.is_allocated(alloc));
                    live.push(Live::Raw(alloc, size as usize));
                }
            }
            AllocBlock { size, protect } => {
                if let Some(block) = heap.allocate_block(size as usize, 0, 0) {
                    assert_eq!(block.block_size() % heap.page_size(), 0);
                    if protect {
                        assert!(unsafe { heap.protect_block(&block, BlockProtection::Redzones) });
                    }
                    unsafe { block.body().as_ptr().write_bytes(0xcd, block.body_size()) };
                    assert!(heap.is_allocated(block.block()));
                    live.push(Live::Block(block));
                }
            }
            AllocGuarded { size, align_bit } => {
                let layout = Layout::from_size_align(size as usize, 1 << (align_bit % 12)).unwrap();
                if let Ok(body) = guarded.allocate(layout) {
                    let body = body.cast::<u8>();
                    unsafe { body.as_ptr().write_bytes(0xef, layout.size()) };
                    live.push(Live::Guarded(body, layout));
                }
            }
            Free { index } => {
                if index as usize >= live.len() { continue; }

                match live.swap_remove(index as usize) {
                    Live::Raw(alloc, _) => assert!(unsafe { heap.free(alloc) }),
                    Live::Block(block) => assert!(unsafe { heap.free_block(&block) }),
                    Live::Guarded(body, layout) => unsafe { guarded.deallocate(body, layout) },
                }
            }
            FreeInterior { index, offset } => {
                if index as usize >= live.len() || offset == 0 { continue; }

                let base = match &live[index as usize] {
                    Live::Raw(alloc, _) => *alloc,
                    Live::Block(block) => block.block(),
                    Live::Guarded(body, _) => *body,
                };

                let interior = base.as_ptr().wrapping_add(offset as usize);
                let Some(interior) = NonNull::new(interior) else { continue };
                // an offset can run into a neighbouring mapping
                if heap.is_allocated(interior) { continue; }

                assert!(!unsafe { heap.free(interior) });
            }
            DoubleFree { index } => {
                if index as usize >= live.len() { continue; }

                match live.swap_remove(index as usize) {
                    Live::Raw(alloc, _) => {
                        assert!(unsafe { heap.free(alloc) });
                        assert!(!unsafe { heap.free(alloc) });
                    }
                    Live::Block(block) => {
                        assert!(unsafe { heap.free_block(&block) });
                        assert!(!unsafe { heap.free_block(&block) });
                    }
                    Live::Guarded(body, layout) => unsafe { guarded.deallocate(body, layout) },
                }
            }
        }

        assert_eq!(heap.len(), live.len());
    }

    for l in live {
        match l {
            Live::Raw(alloc, _) => assert!(unsafe { heap.free(alloc) }),
            Live::Block(block) => assert!(unsafe { heap.free_block(&block) }),
            Live::Guarded(body, layout) => unsafe { guarded.deallocate(body, layout) },
        }
    }

    assert!(heap.is_empty());
    assert_eq!(notifier.in_use_bytes(), 0);
});
