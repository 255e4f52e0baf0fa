use std::mem::MaybeUninit;

use crate::linked_pool::PoolOptions;
use crate::{
    CoalescePolicy, DropPolicy, DynamicPool, GlobalMemory, GrowablePool, GrowthPolicy,
    HeapRecords, LinkedPool, MemorySource, RecordStore, Result,
};

/// Builder for creating an instance of [`LinkedPool`] or one of its aliases.
///
/// All settings are optional. A pool built without [`seed()`][Self::seed] has no memory until
/// some is added.
///
/// # Examples
///
/// ```
/// use block_pool::{CoalescePolicy, FastLinkedPool, StackBuffer};
///
/// let mut buffer = StackBuffer::<1024>::new();
///
/// let pool = FastLinkedPool::<16>::builder()
///     .seed(&mut buffer)
///     .coalesce(CoalescePolicy::Manual)
///     .build()
///     .unwrap();
/// # drop(pool);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) whenever the record store is, so a pool can be
/// configured on a different thread than the one that uses it.
#[derive(Debug)]
#[must_use]
pub struct LinkedPoolBuilder<'buf, R = HeapRecords> {
    seed: Option<&'buf mut [MaybeUninit<u8>]>,
    records: Option<R>,
    options: PoolOptions,
    reserved_records: usize,
}

impl<'buf, R: RecordStore + Default> LinkedPoolBuilder<'buf, R> {
    pub(crate) fn new() -> Self {
        Self {
            seed: None,
            records: None,
            options: PoolOptions::default(),
            reserved_records: 0,
        }
    }

    /// Lends the pool a buffer to use as its first region.
    pub fn seed(mut self, buffer: &'buf mut [MaybeUninit<u8>]) -> Self {
        self.seed = Some(buffer);
        self
    }

    /// Uses the given record store instead of a default-constructed one.
    pub fn records(mut self, records: R) -> Self {
        self.records = Some(records);
        self
    }

    /// Sets when freed blocks are joined with their neighbours.
    pub fn coalesce(mut self, policy: CoalescePolicy) -> Self {
        self.options.coalesce = policy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how to treat remaining
    /// allocations when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.options.drop_policy = policy;
        self
    }

    /// Sets how many released records the pool keeps aside for future splits instead of
    /// returning them to the store.
    pub fn max_spare_records(mut self, count: usize) -> Self {
        self.options.max_spare_records = count;
        self
    }

    /// Obtains `count` records up front so the first splits do not have to.
    pub fn reserved_records(mut self, count: usize) -> Self {
        self.reserved_records = count;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Errors
    ///
    /// [`Error::RecordsExhausted`][crate::Error::RecordsExhausted] if the record store cannot
    /// supply the record for the seed region or the reserved records,
    /// [`Error::ZeroSize`][crate::Error::ZeroSize] if the seed buffer is empty.
    pub fn build(self) -> Result<LinkedPool<'buf, R>> {
        let mut pool =
            LinkedPool::with_records(self.records.unwrap_or_default(), self.options);

        if let Some(buffer) = self.seed {
            pool.seed(buffer)?;
        }

        pool.reserve_records(self.reserved_records)?;

        Ok(pool)
    }
}

/// Builder for creating an instance of [`DynamicPool`] or one of its aliases.
///
/// Besides the settings of [`LinkedPoolBuilder`], a dynamic pool has a memory source, a growth
/// policy, a minimum growth step and an initial capacity.
///
/// # Examples
///
/// ```
/// use block_pool::{GrowthPolicy, HeapPool, MemPool};
///
/// let pool = HeapPool::<8>::builder()
///     .initial_capacity(4096)
///     .min_growth(1024)
///     .growth(GrowthPolicy::OnDemand)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.size(), 4096);
/// ```
#[derive(Debug)]
#[must_use]
pub struct DynamicPoolBuilder<'buf, R = HeapRecords, M = GlobalMemory> {
    linked: LinkedPoolBuilder<'buf, R>,
    source: M,
    growth: GrowthPolicy,
    min_growth: usize,
    initial_capacity: usize,
}

impl<'buf, R: RecordStore + Default> DynamicPoolBuilder<'buf, R, GlobalMemory> {
    pub(crate) fn new() -> Self {
        Self {
            linked: LinkedPoolBuilder::new(),
            source: GlobalMemory,
            growth: GrowthPolicy::default(),
            min_growth: 0,
            initial_capacity: 0,
        }
    }
}

impl<'buf, R: RecordStore + Default, M: MemorySource> DynamicPoolBuilder<'buf, R, M> {
    /// Lends the pool a buffer to use as its first region. The pool never releases it.
    pub fn seed(mut self, buffer: &'buf mut [MaybeUninit<u8>]) -> Self {
        self.linked = self.linked.seed(buffer);
        self
    }

    /// Uses the given record store instead of a default-constructed one.
    pub fn records(mut self, records: R) -> Self {
        self.linked = self.linked.records(records);
        self
    }

    /// Sets when freed blocks are joined with their neighbours.
    pub fn coalesce(mut self, policy: CoalescePolicy) -> Self {
        self.linked = self.linked.coalesce(policy);
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.linked = self.linked.drop_policy(policy);
        self
    }

    /// Sets how many released records the pool keeps aside for future splits.
    pub fn max_spare_records(mut self, count: usize) -> Self {
        self.linked = self.linked.max_spare_records(count);
        self
    }

    /// Obtains `count` records up front so the first splits do not have to.
    pub fn reserved_records(mut self, count: usize) -> Self {
        self.linked = self.linked.reserved_records(count);
        self
    }

    /// Obtains regions from `source` instead.
    pub fn memory_source<S: MemorySource>(self, source: S) -> DynamicPoolBuilder<'buf, R, S> {
        DynamicPoolBuilder {
            linked: self.linked,
            source,
            growth: self.growth,
            min_growth: self.min_growth,
            initial_capacity: self.initial_capacity,
        }
    }

    /// Sets whether allocations that do not fit grow the pool by themselves.
    pub fn growth(mut self, policy: GrowthPolicy) -> Self {
        self.growth = policy;
        self
    }

    /// Sets the smallest region the pool will request from its memory source.
    pub fn min_growth(mut self, size: usize) -> Self {
        self.min_growth = size;
        self
    }

    /// Makes sure a free block of at least `size` bytes exists once the pool is built,
    /// counting the seed buffer.
    pub fn initial_capacity(mut self, size: usize) -> Self {
        self.initial_capacity = size;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Errors
    ///
    /// As [`LinkedPoolBuilder::build()`], plus
    /// [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the initial capacity cannot be
    /// obtained from the memory source.
    pub fn build(self) -> Result<DynamicPool<'buf, R, M>> {
        let linked = self.linked.build()?;

        let mut pool = DynamicPool::from_parts(linked, self.source, self.growth, self.min_growth);

        if self.initial_capacity > 0 {
            pool.reserve(self.initial_capacity)?;
        }

        Ok(pool)
    }
}
