//! Demonstrates fragmentation and explicit growth with a `HeapPool`.
//!
//! Two allocations are made, the first is released, and the pool then refuses a request that
//! would fit in the free bytes but not in any single free block. Reserving fixes that.

use block_pool::{Allocator, GrowablePool, HeapPool, MemPool};

fn main() {
    println!("=== HeapPool Basic Example ===");
    println!();

    let mut pool = HeapPool::<4>::builder()
        .initial_capacity(100)
        .build()
        .expect("the global allocator can supply 100 bytes");

    println!("Created pool of {} bytes", pool.size());

    let a = pool.allocate_raw(40, false).expect("fits in the fresh pool");
    let b = pool.allocate_raw(30, true).expect("fits after the first allocation");
    println!(
        "After allocating 40 and 30 bytes: used {}, free {}",
        pool.used_count(),
        pool.free_count()
    );

    pool.deallocate_raw(a, 40).expect("a is live");
    println!(
        "After releasing the 40 byte allocation: used {}, free {}",
        pool.used_count(),
        pool.free_count()
    );

    match pool.allocate_raw(50, false) {
        Ok(_) => println!("Unexpectedly found 50 contiguous bytes"),
        Err(error) => println!("Allocating 50 bytes failed: {error}"),
    }

    pool.reserve(50).expect("the global allocator can supply 50 bytes");
    println!("Reserved 50 more bytes, pool is now {} bytes", pool.size());

    let c = pool.allocate_raw(50, false).expect("the new region fits it");
    println!("Allocated 50 bytes, used {}", pool.used_count());

    for block in pool.linked().blocks() {
        println!(
            "  block of {:>3} bytes, {}{}",
            block.size(),
            if block.is_free() { "free" } else { "allocated" },
            if block.is_root() { " (region start)" } else { "" }
        );
    }

    pool.deallocate_raw(b, 30).expect("b is live");
    pool.deallocate_raw(c, 50).expect("c is live");

    println!("Released {} idle bytes", pool.shrink());
}
