//! Integration tests for the `block_pool` package.
//!
//! These exercise the pool flavors through the public API only: the fragmentation scenario that
//! motivates `reserve()`, growth and shrinking against the global allocator, stack-only pools
//! and the typed allocation helpers.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;
use std::slice;

use block_pool::{
    Allocator, BufHeapPool, CoalescePolicy, Error, FastLinkedPool, GrowablePool, GrowthPolicy,
    HeapPool, HeapRecords, LinkedPool, MemPool, StackBuffer, StackPool,
};

fn fill(ptr: NonNull<u8>, len: usize, value: u8) {
    unsafe { ptr.write_bytes(value, len) };
}

fn holds(ptr: NonNull<u8>, len: usize, value: u8) -> bool {
    unsafe { slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|byte| *byte == value)
}

#[test]
fn fragmented_heap_pool_needs_reserve() {
    let mut pool = HeapPool::<4>::builder()
        .initial_capacity(100)
        .build()
        .unwrap();
    assert_eq!(pool.size(), 100);

    let a = pool.allocate_raw(40, false).unwrap();
    let b = pool.allocate_raw(30, false).unwrap();
    fill(b, 30, 0xB0);

    assert_eq!(pool.used_count(), 70);
    assert_eq!(pool.free_count(), 30);

    pool.deallocate_raw(a, 40).unwrap();
    assert_eq!(pool.used_count(), 30);
    assert_eq!(pool.free_count(), 70);

    // 70 bytes are free, but split 40 before b and 30 after it.
    assert_eq!(
        pool.allocate_raw(50, false),
        Err(Error::OutOfCapacity { requested: 50 })
    );
    assert!(holds(b, 30, 0xB0));

    pool.reserve(50).unwrap();
    assert_eq!(pool.size(), 150);

    let c = pool.allocate_raw(50, false).unwrap();
    assert_eq!(pool.used_count(), 80);
    assert!(holds(b, 30, 0xB0));

    // Everything fit in the in-object records.
    assert!(pool.linked().records().fallback().is_empty());

    pool.deallocate_raw(c, 50).unwrap();
    pool.deallocate_raw(b, 30).unwrap();
    assert!(pool.linked().is_empty());
}

#[test]
fn heap_pool_grows_and_shrinks() {
    let mut pool = HeapPool::<8>::builder()
        .growth(GrowthPolicy::OnDemand)
        .min_growth(128)
        .build()
        .unwrap();

    let small = pool.allocate_raw(16, false).unwrap();
    assert_eq!(pool.size(), 128);

    let large = pool.allocate_raw(512, false).unwrap();
    assert_eq!(pool.size(), 640);
    assert_eq!(pool.linked().region_count(), 2);

    pool.deallocate_raw(large, 512).unwrap();
    assert_eq!(pool.shrink(), 512);
    assert_eq!(pool.size(), 128);

    pool.deallocate_raw(small, 16).unwrap();
    assert_eq!(pool.shrink(), 128);
    assert_eq!(pool.size(), 0);
}

#[test]
fn buffer_is_used_before_the_heap() {
    let mut buffer = StackBuffer::<64>::new();
    let mut pool = BufHeapPool::<4>::builder()
        .seed(&mut buffer)
        .growth(GrowthPolicy::OnDemand)
        .build()
        .unwrap();

    let first = pool.allocate_raw(48, false).unwrap();
    assert_eq!(pool.linked().region_count(), 1);

    let second = pool.allocate_raw(48, false).unwrap();
    assert_eq!(pool.linked().region_count(), 2);

    pool.deallocate_raw(first, 48).unwrap();
    pool.deallocate_raw(second, 48).unwrap();

    // The seeded buffer stays, the grown region goes.
    assert_eq!(pool.shrink(), 48);
    assert_eq!(pool.size(), 64);
}

#[test]
fn stack_pool_never_needs_the_heap() {
    let mut buffer = StackBuffer::<256>::new();
    let mut pool = StackPool::<4>::with_buffer(&mut buffer).unwrap();

    // The region plus three splits use up all four records.
    let a = pool.allocate_raw(10, false).unwrap();
    let b = pool.allocate_raw(10, false).unwrap();
    let c = pool.allocate_raw(10, false).unwrap();
    assert_eq!(pool.records().cached_len(), 4);

    assert_eq!(pool.allocate_raw(10, false), Err(Error::RecordsExhausted));

    // Both neighbours of b are still allocated, so freeing it joins nothing and d reuses b's
    // block as an exact fit.
    pool.deallocate_raw(b, 10).unwrap();
    let d = pool.allocate_raw(10, false).unwrap();
    assert_eq!(d, b);

    pool.deallocate_raw(a, 10).unwrap();
    pool.deallocate_raw(c, 10).unwrap();
    pool.deallocate_raw(d, 10).unwrap();
    assert_eq!(pool.block_count(), 1);
}

#[test]
fn moving_a_stack_pool_keeps_pointers_valid() {
    let mut buffer = StackBuffer::<64>::new();
    let mut pool = StackPool::<4>::with_buffer(&mut buffer).unwrap();

    let ptr = pool.allocate_raw(8, false).unwrap();
    fill(ptr, 8, 0x11);

    let mut moved = Box::new(pool);

    assert!(holds(ptr, 8, 0x11));
    moved.deallocate_raw(ptr, 8).unwrap();
    assert!(moved.is_empty());
}

#[test]
fn partial_release_of_typed_array() {
    let mut buffer = StackBuffer::<256>::new();
    let mut pool = FastLinkedPool::<8>::with_buffer(&mut buffer).unwrap();

    let values = pool.construct_multiple(8, |index| index as u32).unwrap();
    assert_eq!(pool.used_count(), 32);

    // Give back the middle four elements and keep the rest.
    let middle = unsafe { values.add(2) };
    pool.deallocate(middle, 4).unwrap();
    assert_eq!(pool.used_count(), 16);

    assert_eq!(unsafe { values.read() }, 0);
    assert_eq!(unsafe { values.add(7).read() }, 7);

    pool.deallocate(values, 2).unwrap();
    pool.deallocate(unsafe { values.add(6) }, 2).unwrap();
    assert!(pool.is_empty());
    assert_eq!(pool.block_count(), 1);
}

#[test]
fn typed_values_are_aligned() {
    #[repr(align(64))]
    struct CacheLine([u8; 64]);

    let mut buffer = StackBuffer::<512>::new();
    let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

    let _odd = pool.allocate_raw(1, false).unwrap();
    let line = pool.construct(CacheLine([7; 64])).unwrap();

    assert_eq!(line.as_ptr().addr() % 64, 0);
    assert_eq!(pool.used_count(), 65);
    assert_eq!(unsafe { line.as_ref() }.0[63], 7);

    unsafe { pool.destruct(line, 1) }.unwrap();
    assert_eq!(pool.used_count(), 1);
}

#[test]
fn typed_values_fill_exactly_sized_pools() {
    let mut pool = HeapPool::<4>::builder()
        .initial_capacity(32)
        .build()
        .unwrap();

    let values = pool.allocate::<u64>(4).unwrap();
    assert_eq!(pool.used_count(), 32);
    assert_eq!(pool.size(), 32);

    pool.deallocate(values, 4).unwrap();

    let mut buffer = StackBuffer::<64>::new();
    let mut stack_pool = StackPool::<2>::with_buffer(&mut buffer).unwrap();

    let values = stack_pool.construct_multiple(8, |index| index as u64).unwrap();
    assert_eq!(stack_pool.free_count(), 0);
    assert_eq!(unsafe { values.add(7).read() }, 7);

    unsafe { stack_pool.destruct(values, 8) }.unwrap();
}

#[test]
fn manual_coalescing_until_asked() {
    let mut buffer = StackBuffer::<96>::new();
    let mut pool = LinkedPool::<HeapRecords>::builder()
        .seed(&mut buffer)
        .coalesce(CoalescePolicy::Manual)
        .build()
        .unwrap();

    let ptrs: Vec<_> = (0..3)
        .map(|_| pool.allocate_raw(32, false).unwrap())
        .collect();

    for ptr in ptrs {
        pool.deallocate_raw(ptr, 32).unwrap();
    }

    assert_eq!(pool.largest_free_block(), 32);
    assert!(pool.allocate_raw(64, false).is_err());

    assert_eq!(pool.join_free_blocks(), 2);
    assert_eq!(pool.largest_free_block(), 96);
    assert!(pool.allocate_raw(64, false).is_ok());
}

#[test]
fn foreign_and_repeated_frees_are_rejected() {
    let mut buffer = StackBuffer::<64>::new();
    let mut other = StackBuffer::<64>::new();
    let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();
    let mut other_pool = LinkedPool::<HeapRecords>::with_buffer(&mut other).unwrap();

    let mine = pool.allocate_raw(16, false).unwrap();
    let theirs = other_pool.allocate_raw(16, false).unwrap();

    assert!(matches!(
        pool.deallocate_raw(theirs, 16),
        Err(Error::InvalidFree { .. })
    ));

    pool.deallocate_raw(mine, 16).unwrap();
    assert!(matches!(
        pool.deallocate_raw(mine, 16),
        Err(Error::DoubleFree { .. })
    ));

    other_pool.deallocate_raw(theirs, 16).unwrap();
}

#[test]
fn pool_can_move_to_another_thread() {
    let mut pool = HeapPool::<4>::builder()
        .initial_capacity(64)
        .build()
        .unwrap();

    let handle = std::thread::spawn(move || {
        let ptr = pool.allocate_raw(32, true).unwrap();
        pool.deallocate_raw(ptr, 32).unwrap();
        pool
    });

    let pool = handle.join().unwrap();
    assert_eq!(pool.size(), 64);
}

#[test]
fn reserve_beyond_free_count_grows_enough() {
    let mut pool = HeapPool::<8>::builder()
        .initial_capacity(64)
        .build()
        .unwrap();
    let _held = pool.allocate_raw(24, false).unwrap();

    for request in [41, 100, 1000] {
        let size_before = pool.size();
        let free_before = pool.free_count();
        assert!(request > free_before);

        pool.reserve(request).unwrap();

        assert!(pool.size() >= size_before + (request - free_before));
        assert!(pool.has_block_for(request));
    }
}

#[test]
fn exhausted_pool_keeps_its_block_list() {
    let mut buffer = StackBuffer::<64>::new();
    let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

    let a = pool.allocate_raw(20, false).unwrap();
    let before: Vec<_> = pool.blocks().map(|block| (block.size(), block.is_free())).collect();

    assert_eq!(
        pool.allocate_raw(pool.free_count() + 1, false),
        Err(Error::OutOfCapacity { requested: 45 })
    );

    let after: Vec<_> = pool.blocks().map(|block| (block.size(), block.is_free())).collect();
    assert_eq!(before, after);

    pool.deallocate_raw(a, 20).unwrap();
}
