use std::mem::MaybeUninit;
use std::ptr::NonNull;

use tracing::debug;

use crate::linked_pool::PoolOptions;
use crate::{
    Allocator, CachedRecords, DynamicPoolBuilder, Error, GlobalMemory, GrowablePool,
    GrowthPolicy, HeapRecords, LinkedPool, MemPool, MemorySource, RecordStore, RegionOrigin,
    Result,
};

/// A dynamic pool whose first `N` block records live inside the pool object.
pub type FastDynamicPool<'buf, const N: usize, M = GlobalMemory> =
    DynamicPool<'buf, CachedRecords<N>, M>;

/// A pool that obtains all of its memory from the global allocator and keeps its first `N`
/// block records inside the pool object.
///
/// # Examples
///
/// ```
/// use block_pool::{Allocator, GrowablePool, HeapPool, MemPool};
///
/// let mut pool = HeapPool::<4>::builder().initial_capacity(100).build().unwrap();
///
/// let a = pool.allocate_raw(40, false).unwrap();
/// let b = pool.allocate_raw(30, false).unwrap();
/// pool.deallocate_raw(a, 40).unwrap();
///
/// // 70 bytes are free, but not in one piece.
/// assert!(pool.allocate_raw(50, false).is_err());
///
/// pool.reserve(50).unwrap();
/// let c = pool.allocate_raw(50, false).unwrap();
/// # pool.deallocate_raw(b, 30).unwrap();
/// # pool.deallocate_raw(c, 50).unwrap();
/// ```
pub type HeapPool<const N: usize> = DynamicPool<'static, CachedRecords<N>, GlobalMemory>;

/// A pool that starts out with a borrowed buffer (usually a [`StackBuffer`][crate::StackBuffer])
/// and obtains further regions from the global allocator.
pub type BufHeapPool<'buf, const N: usize> = DynamicPool<'buf, CachedRecords<N>, GlobalMemory>;

/// A [`LinkedPool`] that can add regions obtained from a [`MemorySource`] and give idle ones
/// back.
///
/// Regions added through the memory source are released to it again by
/// [`shrink()`][GrowablePool::shrink] once they are entirely free, and when the pool is dropped.
/// Seeded regions are never released.
///
/// With [`GrowthPolicy::OnDemand`], an allocation that does not fit adds a region of at least
/// the requested size (see [`DynamicPoolBuilder::min_growth()`]) and retries once.
#[derive(Debug)]
pub struct DynamicPool<'buf, R: RecordStore = HeapRecords, M: MemorySource = GlobalMemory> {
    pool: LinkedPool<'buf, R>,
    source: M,
    growth: GrowthPolicy,
    min_growth: usize,
}

impl<'buf, R: RecordStore + Default> DynamicPool<'buf, R, GlobalMemory> {
    /// Creates a builder for configuring a pool.
    pub fn builder() -> DynamicPoolBuilder<'buf, R, GlobalMemory> {
        DynamicPoolBuilder::new()
    }
}

impl<'buf, R: RecordStore + Default, M: MemorySource + Default> DynamicPool<'buf, R, M> {
    /// Creates a pool with no memory and default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(M::default())
    }

    /// Creates a pool with default settings whose first region is the given buffer.
    ///
    /// # Errors
    ///
    /// As [`LinkedPool::with_buffer()`].
    pub fn with_buffer(buffer: &'buf mut [MaybeUninit<u8>]) -> Result<Self> {
        let mut pool = Self::new();
        pool.pool.seed(buffer)?;
        Ok(pool)
    }
}

impl<R: RecordStore + Default, M: MemorySource + Default> Default for DynamicPool<'_, R, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RecordStore + Default, M: MemorySource> DynamicPool<'_, R, M> {
    /// Creates a pool with no memory and default settings that grows from `source`.
    #[must_use]
    pub fn with_source(source: M) -> Self {
        Self::from_parts(
            LinkedPool::with_records(R::default(), PoolOptions::default()),
            source,
            GrowthPolicy::default(),
            0,
        )
    }
}

impl<'buf, R: RecordStore, M: MemorySource> DynamicPool<'buf, R, M> {
    pub(crate) fn from_parts(
        pool: LinkedPool<'buf, R>,
        source: M,
        growth: GrowthPolicy,
        min_growth: usize,
    ) -> Self {
        Self {
            pool,
            source,
            growth,
            min_growth,
        }
    }

    /// The underlying block list, for introspection.
    #[must_use]
    pub fn linked(&self) -> &LinkedPool<'buf, R> {
        &self.pool
    }

    /// The underlying block list, for seeding more regions or joining free blocks.
    #[must_use]
    pub fn linked_mut(&mut self) -> &mut LinkedPool<'buf, R> {
        &mut self.pool
    }

    /// The source regions are obtained from.
    #[must_use]
    pub fn source(&self) -> &M {
        &self.source
    }

    /// Whether allocations that do not fit grow the pool by themselves.
    #[must_use]
    pub fn growth_policy(&self) -> GrowthPolicy {
        self.growth
    }

    /// The smallest region the pool requests from its memory source.
    #[must_use]
    pub fn min_growth(&self) -> usize {
        self.min_growth
    }
}

impl<R: RecordStore, M: MemorySource> Allocator for DynamicPool<'_, R, M> {
    fn allocate_raw(&mut self, count: usize, clear: bool) -> Result<NonNull<u8>> {
        self.allocate_aligned(count, 1, clear)
    }

    fn allocate_aligned(&mut self, count: usize, align: usize, clear: bool) -> Result<NonNull<u8>> {
        match self.pool.allocate_aligned(count, align, clear) {
            Err(Error::OutOfCapacity { .. }) if self.growth == GrowthPolicy::OnDemand => {
                // The source may hand out a region at any address.
                let padded = count
                    .checked_add(align.wrapping_sub(1))
                    .ok_or(Error::SizeOverflow)?;

                self.reserve_more(padded)?;
                self.pool.allocate_aligned(count, align, clear)
            }
            result => result,
        }
    }

    fn deallocate_raw(&mut self, ptr: NonNull<u8>, count: usize) -> Result<()> {
        self.pool.deallocate_raw(ptr, count)
    }
}

impl<R: RecordStore, M: MemorySource> MemPool for DynamicPool<'_, R, M> {
    fn size(&self) -> usize {
        self.pool.size()
    }

    fn used_count(&self) -> usize {
        self.pool.used_count()
    }

    fn has_block_for(&self, size: usize) -> bool {
        self.pool.has_block_for(size)
    }
}

impl<R: RecordStore, M: MemorySource> GrowablePool for DynamicPool<'_, R, M> {
    fn reserve(&mut self, size: usize) -> Result<()> {
        if size == 0 || self.pool.has_block_for(size) {
            return Ok(());
        }

        self.reserve_more(size)
    }

    fn reserve_more(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }

        let size = size.max(self.min_growth);

        let Some(mem) = self.source.allocate_memory(size) else {
            debug!(size, "memory source could not supply a region");
            return Err(Error::OutOfMemory { requested: size });
        };

        // SAFETY: The source handed us exclusive use of the region until we give it back, which
        // only happens once the pool no longer lists it.
        if let Err(error) = unsafe { self.pool.push_region(mem, size, RegionOrigin::Grown) } {
            // SAFETY: The region came from this source a moment ago and was never used.
            unsafe {
                self.source.deallocate_memory(mem, size);
            }

            return Err(error);
        }

        Ok(())
    }

    fn shrink(&mut self) -> usize {
        let source = &mut self.source;

        self.pool.release_idle_regions(|mem, size| {
            // SAFETY: Only grown regions are released, each exactly once, with the size they
            // were obtained with.
            unsafe {
                source.deallocate_memory(mem, size);
            }
        })
    }
}

impl<R: RecordStore, M: MemorySource> Drop for DynamicPool<'_, R, M> {
    fn drop(&mut self) {
        let source = &mut self.source;

        // The inner pool checks its drop policy afterwards, when it is dropped itself.
        self.pool.drain_regions(|mem, size, origin| {
            if origin == RegionOrigin::Grown {
                // SAFETY: Grown regions came from this source with this size and the pool has
                // just forgotten them.
                unsafe {
                    source.deallocate_memory(mem, size);
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{CoalescePolicy, DropPolicy, NoRecords, StackBuffer};

    assert_impl_all!(HeapPool<4>: Send, std::fmt::Debug);
    assert_not_impl_any!(HeapPool<4>: Sync);

    /// Hands out global memory and keeps track of how many bytes are outstanding.
    #[derive(Debug, Default)]
    struct CountingSource {
        outstanding: Rc<Cell<usize>>,
        requests: Rc<Cell<usize>>,
    }

    impl MemorySource for CountingSource {
        fn allocate_memory(&mut self, size: usize) -> Option<NonNull<u8>> {
            self.requests.set(self.requests.get() + 1);
            let mem = GlobalMemory.allocate_memory(size)?;
            self.outstanding.set(self.outstanding.get() + size);
            Some(mem)
        }

        unsafe fn deallocate_memory(&mut self, ptr: NonNull<u8>, size: usize) {
            self.outstanding.set(self.outstanding.get() - size);
            unsafe { GlobalMemory.deallocate_memory(ptr, size) };
        }
    }

    #[derive(Debug, Default)]
    struct EmptySource;

    impl MemorySource for EmptySource {
        fn allocate_memory(&mut self, _size: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate_memory(&mut self, _ptr: NonNull<u8>, _size: usize) {
            panic!("EmptySource never hands out memory");
        }
    }

    fn counting() -> (DynamicPool<'static, HeapRecords, CountingSource>, Rc<Cell<usize>>) {
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);
        (DynamicPool::with_source(source), outstanding)
    }

    #[test]
    fn reserve_adds_region_only_when_needed() {
        let (mut pool, outstanding) = counting();

        pool.reserve(64).unwrap();
        assert_eq!(pool.size(), 64);
        assert_eq!(outstanding.get(), 64);

        pool.reserve(64).unwrap();
        pool.reserve(10).unwrap();
        assert_eq!(pool.size(), 64);
        assert_eq!(pool.source().requests.get(), 1);

        pool.reserve(65).unwrap();
        assert_eq!(pool.size(), 129);
        assert_eq!(pool.linked().region_count(), 2);
    }

    #[test]
    fn reserve_more_always_grows() {
        let (mut pool, _outstanding) = counting();

        pool.reserve_more(8).unwrap();
        pool.reserve_more(8).unwrap();

        assert_eq!(pool.size(), 16);
        assert_eq!(pool.reserve_more(0), Err(Error::ZeroSize));
    }

    #[test]
    fn min_growth_rounds_up_regions() {
        let mut pool = DynamicPool::<HeapRecords>::builder()
            .min_growth(256)
            .build()
            .unwrap();

        pool.reserve(10).unwrap();
        assert_eq!(pool.size(), 256);
        assert_eq!(pool.min_growth(), 256);
    }

    #[test]
    fn manual_growth_does_not_grow_on_allocation() {
        let (mut pool, outstanding) = counting();

        assert_eq!(
            pool.allocate_raw(8, false),
            Err(Error::OutOfCapacity { requested: 8 })
        );
        assert_eq!(outstanding.get(), 0);
    }

    #[test]
    fn on_demand_growth_retries_once() {
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);

        let mut pool = DynamicPool::<HeapRecords>::builder()
            .memory_source(source)
            .growth(GrowthPolicy::OnDemand)
            .build()
            .unwrap();

        let a = pool.allocate_raw(40, false).unwrap();
        assert_eq!(outstanding.get(), 40);

        let b = pool.allocate_raw(8, false).unwrap();
        assert_eq!(pool.linked().region_count(), 2);

        pool.deallocate_raw(a, 40).unwrap();
        pool.deallocate_raw(b, 8).unwrap();
        assert_eq!(pool.shrink(), 48);
        assert_eq!(outstanding.get(), 0);
    }

    #[test]
    fn on_demand_growth_leaves_room_for_alignment() {
        let mut pool = HeapPool::<4>::builder()
            .growth(GrowthPolicy::OnDemand)
            .build()
            .unwrap();

        let odd = pool.allocate_raw(3, false).unwrap();
        assert_eq!(pool.size(), 3);

        let values = pool.allocate::<u64>(2).unwrap();
        assert_eq!(values.as_ptr().addr() % align_of::<u64>(), 0);
        assert_eq!(pool.linked().region_count(), 2);
        assert_eq!(pool.size(), 3 + 16 + 7);
        assert_eq!(pool.used_count(), 3 + 16);

        pool.deallocate(values, 2).unwrap();
        pool.deallocate_raw(odd, 3).unwrap();
        assert_eq!(pool.shrink(), 26);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mut pool = DynamicPool::<HeapRecords, EmptySource>::with_source(EmptySource);

        assert_eq!(pool.reserve(8), Err(Error::OutOfMemory { requested: 8 }));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn on_demand_growth_reports_out_of_memory() {
        let mut pool = DynamicPool::<HeapRecords>::builder()
            .memory_source(EmptySource)
            .growth(GrowthPolicy::OnDemand)
            .build()
            .unwrap();

        assert_eq!(
            pool.allocate_raw(8, false),
            Err(Error::OutOfMemory { requested: 8 })
        );
    }

    #[test]
    fn region_is_returned_when_no_record_describes_it() {
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);

        let mut pool =
            DynamicPool::<CachedRecords<1, NoRecords>, CountingSource>::with_source(source);

        pool.reserve(16).unwrap();
        assert_eq!(pool.reserve_more(16), Err(Error::RecordsExhausted));

        assert_eq!(pool.size(), 16);
        assert_eq!(outstanding.get(), 16);
    }

    #[test]
    fn shrink_keeps_busy_and_seeded_regions() {
        let mut buffer = StackBuffer::<32>::new();
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);

        let mut pool = DynamicPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .memory_source(source)
            .build()
            .unwrap();

        pool.reserve_more(64).unwrap();
        pool.reserve_more(16).unwrap();

        // Lands in the 64 byte region, the first block that fits.
        let busy = pool.allocate_raw(40, false).unwrap();

        assert_eq!(pool.shrink(), 16);
        assert_eq!(outstanding.get(), 64);
        assert_eq!(pool.size(), 96);
        assert_eq!(pool.linked().region_count(), 2);

        pool.deallocate_raw(busy, 40).unwrap();
        assert_eq!(pool.shrink(), 64);
        assert_eq!(outstanding.get(), 0);
        assert_eq!(pool.size(), 32);

        // Nothing left to release.
        assert_eq!(pool.shrink(), 0);
        pool.linked().assert_consistent();
    }

    #[test]
    fn shrink_joins_first_under_manual_coalescing() {
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);

        let mut pool = DynamicPool::<HeapRecords>::builder()
            .memory_source(source)
            .coalesce(CoalescePolicy::Manual)
            .initial_capacity(32)
            .build()
            .unwrap();

        let a = pool.allocate_raw(16, false).unwrap();
        pool.deallocate_raw(a, 16).unwrap();
        assert_eq!(pool.linked().block_count(), 2);

        assert_eq!(pool.shrink(), 32);
        assert_eq!(outstanding.get(), 0);
    }

    #[test]
    fn drop_returns_grown_regions() {
        let mut buffer = StackBuffer::<16>::new();
        let source = CountingSource::default();
        let outstanding = Rc::clone(&source.outstanding);

        {
            let mut pool = DynamicPool::<HeapRecords>::builder()
                .seed(&mut buffer)
                .memory_source(source)
                .build()
                .unwrap();

            pool.reserve_more(24).unwrap();
            pool.reserve_more(40).unwrap();
            _ = pool.allocate_raw(30, false).unwrap();
            assert_eq!(outstanding.get(), 64);
        }

        assert_eq!(outstanding.get(), 0);
    }

    #[test]
    #[should_panic]
    fn drop_policy_applies_after_release() {
        let mut pool = HeapPool::<4>::builder()
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .initial_capacity(16)
            .build()
            .unwrap();

        _ = pool.allocate_raw(4, false).unwrap();
    }

    #[test]
    fn buffer_first_then_heap() {
        let mut buffer = StackBuffer::<64>::new();
        let base = NonNull::from(&mut *buffer).cast::<u8>();
        let mut pool = BufHeapPool::<4>::with_buffer(&mut buffer).unwrap();

        let a = pool.allocate_raw(64, false).unwrap();
        assert_eq!(a, base);
        assert!(pool.allocate_raw(1, false).is_err());

        pool.reserve(1).unwrap();
        let b = pool.allocate_raw(1, false).unwrap();
        assert_eq!(pool.linked().region_count(), 2);

        pool.deallocate_raw(b, 1).unwrap();
        pool.deallocate_raw(a, 64).unwrap();
    }
}
