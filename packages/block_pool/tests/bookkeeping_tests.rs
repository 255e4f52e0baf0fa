//! Verifies that the in-object record cache keeps bookkeeping away from the fallback store until
//! the cache is exhausted.

use block_pool::{
    Allocator, Block, BlockId, CachedRecords, HeapRecords, LinkedPool, RecordStore, StackBuffer,
};

/// Forwards to a heap store and counts how often records were requested from it.
#[derive(Debug, Default)]
struct CountingRecords {
    inner: HeapRecords,
    acquired: usize,
}

impl RecordStore for CountingRecords {
    fn acquire(&mut self, block: Block) -> Option<BlockId> {
        self.acquired += 1;
        self.inner.acquire(block)
    }

    fn release(&mut self, id: BlockId) {
        self.inner.release(id);
    }

    fn get(&self, id: BlockId) -> &Block {
        self.inner.get(id)
    }

    fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.inner.get_mut(id)
    }
}

type CountingPool<'buf> = LinkedPool<'buf, CachedRecords<8, CountingRecords>>;

#[test]
fn cache_covers_the_first_blocks() {
    let mut buffer = StackBuffer::<1024>::new();
    let mut pool = CountingPool::with_buffer(&mut buffer).unwrap();

    // The region itself takes one record, each allocation that splits takes one more.
    let mut ptrs = Vec::new();
    for _ in 0..7 {
        ptrs.push(pool.allocate_raw(16, false).unwrap());
    }

    assert_eq!(pool.records().cached_len(), 8);
    assert_eq!(pool.records().fallback().acquired, 0);

    ptrs.push(pool.allocate_raw(16, false).unwrap());
    assert_eq!(pool.records().fallback().acquired, 1);

    for ptr in ptrs {
        pool.deallocate_raw(ptr, 16).unwrap();
    }

    assert_eq!(pool.block_count(), 1);
}

#[test]
fn spare_records_avoid_the_fallback() {
    let mut buffer = StackBuffer::<1024>::new();
    let mut pool = CountingPool::with_buffer(&mut buffer).unwrap();

    let ptrs: Vec<_> = (0..10)
        .map(|_| pool.allocate_raw(16, false).unwrap())
        .collect();
    let acquired = pool.records().fallback().acquired;
    assert_eq!(acquired, 3);

    for ptr in ptrs {
        pool.deallocate_raw(ptr, 16).unwrap();
    }

    // The joins above returned records to the spare chain, which serves these splits.
    let ptrs: Vec<_> = (0..8)
        .map(|_| pool.allocate_raw(16, false).unwrap())
        .collect();
    assert_eq!(pool.records().fallback().acquired, acquired);

    for ptr in ptrs {
        pool.deallocate_raw(ptr, 16).unwrap();
    }
}

#[test]
fn reserved_records_come_from_the_cache_first() {
    let mut buffer = StackBuffer::<256>::new();
    let pool = CountingPool::builder()
        .seed(&mut buffer)
        .reserved_records(7)
        .build()
        .unwrap();

    assert_eq!(pool.spare_record_count(), 7);
    assert_eq!(pool.records().cached_len(), 8);
    assert_eq!(pool.records().fallback().acquired, 0);
}
