//! Basic benchmarks for the `block_pool` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use block_pool::{
    Allocator, FastLinkedPool, GrowablePool, HeapPool, HeapRecords, LinkedPool, StackBuffer,
    StackPool,
};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const REGION_SIZE: usize = 64 * 1024;
const ITEM_SIZE: usize = 48;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("bp_round_trip");

    group.bench_function("linked_heap_records", |b| {
        let mut buffer = StackBuffer::<REGION_SIZE>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        b.iter(|| {
            let ptr = pool.allocate_raw(black_box(ITEM_SIZE), false).unwrap();
            pool.deallocate_raw(ptr, ITEM_SIZE).unwrap();
        });
    });

    group.bench_function("fast_linked", |b| {
        let mut buffer = StackBuffer::<REGION_SIZE>::new();
        let mut pool = FastLinkedPool::<16>::with_buffer(&mut buffer).unwrap();

        b.iter(|| {
            let ptr = pool.allocate_raw(black_box(ITEM_SIZE), false).unwrap();
            pool.deallocate_raw(ptr, ITEM_SIZE).unwrap();
        });
    });

    group.bench_function("stack", |b| {
        let mut buffer = StackBuffer::<4096>::new();
        let mut pool = StackPool::<16>::with_buffer(&mut buffer).unwrap();

        b.iter(|| {
            let ptr = pool.allocate_raw(black_box(ITEM_SIZE), false).unwrap();
            pool.deallocate_raw(ptr, ITEM_SIZE).unwrap();
        });
    });

    group.finish();

    let mut fill_group = c.benchmark_group("bp_fill");

    fill_group.bench_function("hundred_then_release", |b| {
        let mut pool = HeapPool::<128>::builder()
            .initial_capacity(REGION_SIZE)
            .build()
            .unwrap();
        let mut ptrs = Vec::with_capacity(100);

        b.iter(|| {
            for _ in 0..100 {
                ptrs.push(pool.allocate_raw(ITEM_SIZE, false).unwrap());
            }

            // Release every other one first to exercise joins on both sides.
            for ptr in ptrs.iter().step_by(2) {
                pool.deallocate_raw(*ptr, ITEM_SIZE).unwrap();
            }
            for ptr in ptrs.iter().skip(1).step_by(2) {
                pool.deallocate_raw(*ptr, ITEM_SIZE).unwrap();
            }

            ptrs.clear();
        });
    });

    fill_group.bench_function("partial_release", |b| {
        let mut pool = HeapPool::<16>::builder()
            .initial_capacity(REGION_SIZE)
            .build()
            .unwrap();

        b.iter(|| {
            let values = pool.allocate::<u64>(64).unwrap();

            // SAFETY: 16 is within the 64 element allocation.
            let middle = unsafe { values.add(16) };
            pool.deallocate(middle, 32).unwrap();
            pool.deallocate(values, 16).unwrap();

            // SAFETY: 48 is within the 64 element allocation.
            pool.deallocate(unsafe { values.add(48) }, 16).unwrap();
        });
    });

    fill_group.bench_function("grow_and_shrink", |b| {
        let mut pool = HeapPool::<16>::new();

        b.iter(|| {
            pool.reserve_more(REGION_SIZE).unwrap();
            black_box(pool.shrink());
        });
    });

    fill_group.finish();
}
