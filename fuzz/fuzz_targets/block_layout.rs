#![no_main]

use guardheap::BlockLayout;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u8, u8, usize, u32, u32)| {
    let (chunk_bit, align_bit, size, min_left, min_right) = input;

    let chunk_size = 1usize << (chunk_bit % 24);
    let alignment = 1usize << ((align_bit % 24).min(chunk_bit % 24));
    let (min_left, min_right) = (min_left as usize, min_right as usize);

    let layout = BlockLayout::try_plan(chunk_size, alignment, size, min_left, min_right);
    let Some(layout) = layout else { return };

    assert!(layout.is_consistent());
    assert_eq!(layout.block_size % chunk_size, 0);
    assert_eq!(layout.body_offset() % alignment, 0);
    assert!(layout.left_redzone_size >= min_left);
    assert!(layout.right_redzone_size >= min_right);
    assert!(layout.body_padding_size < alignment);
    assert_eq!(layout.body_size, size);
});
