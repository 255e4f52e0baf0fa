//! Demonstrates a `StackPool` that never touches the heap, including typed values, partial
//! release of an array and what happens when the in-object records run out.

use block_pool::{Allocator, Error, MemPool, StackBuffer, StackPool};

#[derive(Debug)]
struct Point {
    x: i32,
    y: i32,
}

fn main() {
    println!("=== StackPool Example ===");
    println!();

    let mut buffer = StackBuffer::<512>::new();
    let mut pool = StackPool::<6>::with_buffer(&mut buffer).expect("the buffer is not empty");

    let point = pool
        .construct(Point { x: 3, y: -4 })
        .expect("a point fits in the buffer");

    // SAFETY: The point was constructed above and nothing else refers to it.
    let point_ref = unsafe { point.as_ref() };
    println!("Constructed {point_ref:?} at {:p}", point.as_ptr());

    let squares = pool
        .construct_multiple(10, |index| index * index)
        .expect("ten squares fit in the buffer");
    println!("Constructed ten squares, {} bytes in use", pool.used_count());

    // Keep only the first five squares.
    // SAFETY: Index 5 is within the ten element array and usize has no drop logic.
    pool.deallocate(unsafe { squares.add(5) }, 5)
        .expect("the tail of the array is live");
    println!("Released the last five squares, {} bytes in use", pool.used_count());

    let mut extra = Vec::new();
    loop {
        match pool.allocate_raw(8, false) {
            Ok(ptr) => extra.push(ptr),
            Err(Error::RecordsExhausted) => {
                println!(
                    "Ran out of block records after {} more allocations with {} bytes still free",
                    extra.len(),
                    pool.free_count()
                );
                break;
            }
            Err(error) => {
                println!("Allocation failed: {error}");
                break;
            }
        }
    }

    for ptr in extra {
        pool.deallocate_raw(ptr, 8).expect("allocated above");
    }

    // SAFETY: Neither the squares nor the point are used after this.
    unsafe {
        pool.destruct(squares, 5).expect("the first five squares are live");
        pool.destruct(point, 1).expect("the point is live");
    }

    println!("All released, {} blocks left", pool.block_count());
}
