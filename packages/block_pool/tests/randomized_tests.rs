//! Drives pools through long random sequences of allocations, whole releases and partial
//! releases, checking after every step that the pool's view of its memory is sound.

#![allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;
use std::slice;

use block_pool::{Allocator, CoalescePolicy, HeapRecords, LinkedPool, MemPool, StackBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STEPS: usize = 2_000;

/// A live range handed out by the pool, filled with `tag`.
#[derive(Clone, Copy, Debug)]
struct Piece {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

impl Piece {
    fn start(&self) -> usize {
        self.ptr.as_ptr().addr()
    }

    fn is_intact(&self) -> bool {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
            .iter()
            .all(|byte| *byte == self.tag)
    }
}

fn check(pool: &LinkedPool<'_, HeapRecords>, pieces: &[Piece], region: (usize, usize)) {
    let live: usize = pieces.iter().map(|piece| piece.len).sum();
    assert_eq!(pool.used_count(), live);
    assert_eq!(pool.used_count() + pool.free_count(), pool.size());

    let mut sorted: Vec<_> = pieces.to_vec();
    sorted.sort_by_key(Piece::start);
    for pair in sorted.windows(2) {
        assert!(pair[0].start() + pair[0].len <= pair[1].start(), "overlap");
    }
    for piece in &sorted {
        assert!(piece.start() >= region.0 && piece.start() + piece.len <= region.1);
        assert!(piece.is_intact(), "contents of {piece:?} changed");
    }

    let blocks: Vec<_> = pool.blocks().collect();
    assert_eq!(blocks.iter().map(|block| block.size()).sum::<usize>(), pool.size());

    if pool.coalesce_policy() == CoalescePolicy::OnFree {
        for pair in blocks.windows(2) {
            assert!(
                !(pair[0].is_free() && pair[1].is_free() && !pair[1].is_root()),
                "neighbouring free blocks"
            );
        }
    }
}

fn exercise(pool: &mut LinkedPool<'_, HeapRecords>, region: (usize, usize), seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pieces: Vec<Piece> = Vec::new();
    let mut next_tag = 1_u8;

    for _ in 0..STEPS {
        let roll = rng.random_range(0..10);

        if pieces.is_empty() || roll < 5 {
            let len = rng.random_range(1..=96);
            match pool.allocate_raw(len, false) {
                Ok(ptr) => {
                    let tag = next_tag;
                    next_tag = next_tag.wrapping_add(1).max(1);
                    unsafe { ptr.write_bytes(tag, len) };
                    pieces.push(Piece { ptr, len, tag });
                }
                Err(_) => assert!(!pool.has_block_for(len)),
            }
        } else if roll < 8 {
            let piece = pieces.swap_remove(rng.random_range(0..pieces.len()));
            pool.deallocate_raw(piece.ptr, piece.len).unwrap();
        } else {
            // Release a random sub-range and keep whatever is left on either side.
            let index = rng.random_range(0..pieces.len());
            let piece = pieces.swap_remove(index);
            let offset = rng.random_range(0..piece.len);
            let len = rng.random_range(1..=piece.len - offset);

            let ptr = unsafe { piece.ptr.add(offset) };
            pool.deallocate_raw(ptr, len).unwrap();

            if offset > 0 {
                pieces.push(Piece {
                    len: offset,
                    ..piece
                });
            }

            let rest = piece.len - offset - len;
            if rest > 0 {
                pieces.push(Piece {
                    ptr: unsafe { ptr.add(len) },
                    len: rest,
                    tag: piece.tag,
                });
            }
        }

        check(pool, &pieces, region);
    }

    for piece in pieces {
        pool.deallocate_raw(piece.ptr, piece.len).unwrap();
    }

    pool.join_free_blocks();
    assert!(pool.is_empty());
    assert_eq!(pool.block_count(), pool.region_count());
}

fn bounds(buffer: &StackBuffer<4096>) -> (usize, usize) {
    let start = buffer.as_ptr().addr();
    (start, start + buffer.len())
}

#[test]
fn random_operations_with_eager_coalescing() {
    for seed in 0..4 {
        let mut buffer = StackBuffer::<4096>::new();
        let region = bounds(&buffer);
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        exercise(&mut pool, region, seed);
    }
}

#[test]
fn random_operations_with_manual_coalescing() {
    for seed in 100..104 {
        let mut buffer = StackBuffer::<4096>::new();
        let region = bounds(&buffer);
        let mut pool = LinkedPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .coalesce(CoalescePolicy::Manual)
            .build()
            .unwrap();

        exercise(&mut pool, region, seed);
    }
}
