use std::iter;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::thread;

use tracing::{debug, trace};

use crate::{
    Allocator, Block, BlockId, CachedRecords, CoalescePolicy, DropPolicy, Error, HeapRecords,
    LinkedPoolBuilder, MemPool, NoRecords, RecordStore, RegionOrigin, Result,
};

/// How many released records a pool keeps for reuse unless configured otherwise.
pub(crate) const DEFAULT_MAX_SPARE_RECORDS: usize = 8;

/// Settings shared by every pool flavor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PoolOptions {
    pub(crate) coalesce: CoalescePolicy,
    pub(crate) drop_policy: DropPolicy,
    pub(crate) max_spare_records: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            coalesce: CoalescePolicy::default(),
            drop_policy: DropPolicy::default(),
            max_spare_records: DEFAULT_MAX_SPARE_RECORDS,
        }
    }
}

/// A linked pool whose first `N` block records live inside the pool object.
pub type FastLinkedPool<'buf, const N: usize> = LinkedPool<'buf, CachedRecords<N>>;

/// A linked pool that never touches the heap: its memory comes from a borrowed buffer (usually
/// a [`StackBuffer`][crate::StackBuffer]) and its bookkeeping from `N` in-object records.
///
/// Once all `N` records are in use, allocations that need to split a block fail with
/// [`Error::RecordsExhausted`].
pub type StackPool<'buf, const N: usize> = LinkedPool<'buf, CachedRecords<N, NoRecords>>;

/// A memory pool that hands out byte ranges from a list of blocks, splitting a free block on
/// allocation and isolating the released range on deallocation.
///
/// The pool manages one or more regions of memory. Each region starts out as one free block.
/// Allocation picks the first free block large enough (first fit) and splits it into the
/// allocated part and a free remainder. Deallocation accepts any sub-range of a live
/// allocation and splits the containing block so that exactly that range becomes free.
/// Depending on the [`CoalescePolicy`], freed blocks are joined with free neighbours right
/// away or only when [`join_free_blocks()`][Self::join_free_blocks] is called.
///
/// The records describing the blocks come from a [`RecordStore`], never from the pool's own
/// memory. The pool also keeps a small chain of spare records so that a split after a join
/// does not have to go back to the store.
///
/// This pool never grows by itself. See [`DynamicPool`][crate::DynamicPool] for that.
///
/// # Examples
///
/// ```
/// use block_pool::{Allocator, LinkedPool, MemPool, StackBuffer};
///
/// let mut buffer = StackBuffer::<100>::new();
/// let mut pool = LinkedPool::<block_pool::HeapRecords>::with_buffer(&mut buffer).unwrap();
///
/// let a = pool.allocate_raw(40, false).unwrap();
/// let b = pool.allocate_raw(30, false).unwrap();
/// assert_eq!(pool.used_count(), 70);
///
/// // Release the middle of `a`, keeping its first and last 10 bytes.
/// // SAFETY: 10 is inside the 40 byte allocation.
/// pool.deallocate_raw(unsafe { a.add(10) }, 20).unwrap();
/// assert_eq!(pool.used_count(), 50);
/// # pool.deallocate_raw(a, 10).unwrap();
/// # pool.deallocate_raw(unsafe { a.add(30) }, 10).unwrap();
/// # pool.deallocate_raw(b, 30).unwrap();
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but every operation takes `&mut self` and the pool is
/// not [`Sync`]. Share it between threads only behind a lock.
#[derive(Debug)]
pub struct LinkedPool<'buf, R: RecordStore = HeapRecords> {
    records: R,

    /// First block of the first region.
    root: Option<BlockId>,

    /// Last block of the last region, where new regions are appended.
    end: Option<BlockId>,

    /// Head of the free chain, which links every free block in list order.
    first_free: Option<BlockId>,

    used: usize,
    total: usize,

    /// Records kept for reuse, linked through `Block::next`.
    spare: Option<BlockId>,
    spare_count: usize,

    options: PoolOptions,

    _buffers: PhantomData<&'buf mut [MaybeUninit<u8>]>,
}

/// Where a block was found in the list.
#[derive(Clone, Copy, Debug)]
struct Located {
    id: BlockId,

    /// The block before it in the list.
    prev: Option<BlockId>,

    /// The last free block before it in the list, i.e. its place in the free chain.
    prev_free: Option<BlockId>,
}

impl<'buf, R: RecordStore + Default> LinkedPool<'buf, R> {
    /// Creates a pool with no memory and default settings.
    ///
    /// Add memory with [`seed()`][Self::seed] or [`add_memory()`][Self::add_memory].
    #[must_use]
    pub fn new() -> Self {
        Self::with_records(R::default(), PoolOptions::default())
    }

    /// Creates a builder for configuring a pool.
    pub fn builder() -> LinkedPoolBuilder<'buf, R> {
        LinkedPoolBuilder::new()
    }

    /// Creates a pool with default settings whose memory is the given buffer.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroSize`] if the buffer is empty, [`Error::RecordsExhausted`] if the record
    /// store cannot supply a single record.
    pub fn with_buffer(buffer: &'buf mut [MaybeUninit<u8>]) -> Result<Self> {
        let mut pool = Self::new();
        pool.seed(buffer)?;
        Ok(pool)
    }
}

impl<R: RecordStore + Default> Default for LinkedPool<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'buf, R: RecordStore> LinkedPool<'buf, R> {
    pub(crate) fn with_records(records: R, options: PoolOptions) -> Self {
        Self {
            records,
            root: None,
            end: None,
            first_free: None,
            used: 0,
            total: 0,
            spare: None,
            spare_count: 0,
            options,
            _buffers: PhantomData,
        }
    }

    /// Adds the buffer to the pool as a new region.
    ///
    /// The pool borrows the buffer for as long as the pool exists, so pointers into it remain
    /// valid until they are released or the pool is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroSize`] if the buffer is empty, [`Error::RecordsExhausted`] if no record is
    /// available to describe the region.
    pub fn seed(&mut self, buffer: &'buf mut [MaybeUninit<u8>]) -> Result<()> {
        let size = buffer.len();
        let mem = NonNull::from(buffer).cast::<u8>();

        // SAFETY: The buffer is exclusively borrowed for 'buf, which outlives the pool.
        unsafe { self.push_region(mem, size, RegionOrigin::Seeded) }
    }

    /// Adds `size` bytes at `mem` to the pool as a new region.
    ///
    /// The pool never releases this memory; it merely stops using it when dropped.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroSize`] if `size` is zero, [`Error::RecordsExhausted`] if no record is
    /// available to describe the region.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes of `size` bytes, must not overlap any
    /// other region of this pool and must not be accessed other than through pointers handed
    /// out by the pool for as long as the pool exists.
    pub unsafe fn add_memory(&mut self, mem: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.push_region(mem, size, RegionOrigin::Seeded) }
    }

    /// # Safety
    ///
    /// As [`add_memory()`][Self::add_memory].
    pub(crate) unsafe fn push_region(
        &mut self,
        mem: NonNull<u8>,
        size: usize,
        origin: RegionOrigin,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }

        let id = self.create_record(Block::root(mem, size, origin))?;

        match self.end {
            Some(end) => self.block_mut(end).next = Some(id),
            None => self.root = Some(id),
        }
        self.end = Some(id);

        // The new block is the last block in the list, so it is also the last free block.
        let last_free = self.free_ids().last();
        self.set_next_free(last_free, Some(id));

        // Cannot overflow: regions are distinct memory that fits in the address space.
        self.total = self.total.wrapping_add(size);

        debug!(size, ?origin, total = self.total, "added region");

        Ok(())
    }

    /// The blocks of the pool in list order: regions in the order they were added, blocks
    /// within a region in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.ids().map(|id| self.block(id))
    }

    /// The number of blocks in the pool, free or allocated.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.ids().count()
    }

    /// The number of free blocks in the pool.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_ids().count()
    }

    /// The number of regions added to the pool.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.blocks().filter(|block| block.is_root()).count()
    }

    /// The size of the largest free block, which is the largest allocation that can currently
    /// succeed.
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.free_ids()
            .map(|id| self.block(id).size())
            .max()
            .unwrap_or_default()
    }

    /// Whether `ptr` points into memory managed by this pool, free or not.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.locate(ptr.as_ptr().addr()).is_some()
    }

    /// Whether no bytes are currently allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The number of records kept aside for future splits.
    #[must_use]
    pub fn spare_record_count(&self) -> usize {
        self.spare_count
    }

    /// The store supplying the pool's records.
    #[must_use]
    pub fn records(&self) -> &R {
        &self.records
    }

    /// When freed blocks are joined with their neighbours.
    #[must_use]
    pub fn coalesce_policy(&self) -> CoalescePolicy {
        self.options.coalesce
    }

    /// What happens if the pool is dropped with live allocations.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.options.drop_policy
    }

    /// Makes sure at least `count` spare records are set aside.
    ///
    /// # Errors
    ///
    /// [`Error::RecordsExhausted`] if the store runs out. The records obtained before that
    /// remain set aside.
    pub fn reserve_records(&mut self, count: usize) -> Result<()> {
        if let Some(missing) = count.checked_sub(self.spare_count) {
            self.reserve_more_records(missing)?;
        }

        Ok(())
    }

    /// Obtains `count` more records from the store and sets them aside.
    ///
    /// # Errors
    ///
    /// [`Error::RecordsExhausted`] if the store runs out. The records obtained before that
    /// remain set aside.
    pub fn reserve_more_records(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            let id = self
                .records
                .acquire(Block::spare(self.spare))
                .ok_or(Error::RecordsExhausted)?;

            self.spare = Some(id);
            // Cannot overflow: every spare record occupies memory.
            self.spare_count = self.spare_count.wrapping_add(1);
        }

        Ok(())
    }

    /// Joins every run of neighbouring free blocks within a region into one block and returns
    /// the number of joins performed.
    ///
    /// With [`CoalescePolicy::OnFree`] there is never anything to join.
    pub fn join_free_blocks(&mut self) -> usize {
        let mut joined = 0_usize;
        let mut cursor = self.first_free;

        while let Some(id) = cursor {
            while self.join_block(id) {
                // Cannot overflow: each join removes a block.
                joined = joined.wrapping_add(1);
            }

            cursor = self.block(id).next_free;
        }

        if joined > 0 {
            debug!(joined, "joined free blocks");
        }

        joined
    }

    /// Joins `id` with the next block if both are free and in the same region.
    ///
    /// Returns `false` without changing anything if that is not the case.
    fn join_block(&mut self, id: BlockId) -> bool {
        let block = *self.block(id);

        let Some(next_id) = block.next else {
            return false;
        };

        let next = *self.block(next_id);

        if !block.is_free() || !next.is_free() || next.is_root() {
            return false;
        }

        assert_eq!(
            block.next_free,
            Some(next_id),
            "free chain out of order: free neighbour is not the next free block"
        );

        self.block_mut(id).absorb(&next);

        if self.end == Some(next_id) {
            self.end = Some(id);
        }

        self.destroy_record(next_id);

        trace!(
            address = block.start_addr(),
            size = self.block(id).size(),
            "joined blocks"
        );

        true
    }

    /// Splits `id` so that it is exactly `size` bytes long and returns the block describing
    /// the rest, if there is any. Both halves keep the free state of the original.
    fn split(&mut self, id: BlockId, size: usize) -> Result<Option<BlockId>> {
        let mut head = *self.block(id);

        assert!(
            size <= head.size(),
            "cannot split {} byte block to {size} bytes",
            head.size()
        );

        if size == head.size() {
            return Ok(None);
        }

        let tail = head.cut(size);
        let tail_id = self.create_record(tail)?;

        head.next = Some(tail_id);
        if head.is_free() {
            head.next_free = Some(tail_id);
        }
        *self.block_mut(id) = head;

        if self.end == Some(id) {
            self.end = Some(tail_id);
        }

        trace!(
            address = head.start_addr(),
            size,
            remainder = tail.size(),
            "split block"
        );

        Ok(Some(tail_id))
    }

    fn create_record(&mut self, block: Block) -> Result<BlockId> {
        if let Some(id) = self.spare {
            let record = self.records.get_mut(id);
            self.spare = record.next;
            *record = block;

            self.spare_count = self
                .spare_count
                .checked_sub(1)
                .expect("a spare record implies a positive count");

            return Ok(id);
        }

        self.records.acquire(block).ok_or(Error::RecordsExhausted)
    }

    fn destroy_record(&mut self, id: BlockId) {
        if self.spare_count < self.options.max_spare_records {
            *self.records.get_mut(id) = Block::spare(self.spare);

            self.spare = Some(id);
            // Cannot overflow: bounded by max_spare_records.
            self.spare_count = self.spare_count.wrapping_add(1);
        } else {
            self.records.release(id);
        }
    }

    /// Unlinks every grown region that consists of a single free block, hands its memory to
    /// `release` and returns the number of bytes released.
    pub(crate) fn release_idle_regions(
        &mut self,
        mut release: impl FnMut(NonNull<u8>, usize),
    ) -> usize {
        if self.options.coalesce == CoalescePolicy::Manual {
            self.join_free_blocks();
        }

        let mut released = 0_usize;
        let mut prev = None;
        let mut prev_free = None;
        let mut cursor = self.root;

        while let Some(id) = cursor {
            let block = *self.block(id);
            cursor = block.next;

            let idle = block.origin() == Some(RegionOrigin::Grown)
                && block.is_free()
                && block.next.is_none_or(|next| self.block(next).is_root());

            if !idle {
                if block.is_free() {
                    prev_free = Some(id);
                }
                prev = Some(id);
                continue;
            }

            match prev {
                Some(prev) => self.block_mut(prev).next = block.next,
                None => self.root = block.next,
            }

            if self.end == Some(id) {
                self.end = prev;
            }

            self.set_next_free(prev_free, block.next_free);
            self.destroy_record(id);

            self.total = self
                .total
                .checked_sub(block.size())
                .expect("the region was counted when it was added");
            // Cannot overflow: bounded by the previous total.
            released = released.wrapping_add(block.size());

            debug!(size = block.size(), total = self.total, "released idle region");

            release(block.mem(), block.size());
        }

        released
    }

    /// Removes every region from the pool, handing each to `release` together with its size
    /// and origin.
    ///
    /// The count of used bytes is left as it was so that the drop policy still sees the
    /// allocations that were outstanding.
    pub(crate) fn drain_regions(
        &mut self,
        mut release: impl FnMut(NonNull<u8>, usize, RegionOrigin),
    ) {
        let mut region: Option<(NonNull<u8>, usize, RegionOrigin)> = None;
        let mut cursor = self.root.take();

        while let Some(id) = cursor {
            let block = *self.block(id);
            cursor = block.next;

            if let Some(origin) = block.origin() {
                if let Some((mem, size, origin)) = region.take() {
                    release(mem, size, origin);
                }

                region = Some((block.mem(), block.size(), origin));
            } else if let Some((_, size, _)) = region.as_mut() {
                // Cannot overflow: the blocks of one region add up to its size.
                *size = size.wrapping_add(block.size());
            }

            self.destroy_record(id);
        }

        if let Some((mem, size, origin)) = region {
            release(mem, size, origin);
        }

        self.end = None;
        self.first_free = None;
        self.total = 0;
    }

    fn locate(&self, address: usize) -> Option<Located> {
        let mut prev = None;
        let mut prev_free = None;

        for id in self.ids() {
            let block = self.block(id);

            if block.contains(address) {
                return Some(Located {
                    id,
                    prev,
                    prev_free,
                });
            }

            if block.is_free() {
                prev_free = Some(id);
            }
            prev = Some(id);
        }

        None
    }

    fn set_next_free(&mut self, prev_free: Option<BlockId>, next_free: Option<BlockId>) {
        match prev_free {
            Some(id) => self.block_mut(id).next_free = next_free,
            None => self.first_free = next_free,
        }
    }

    fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        iter::successors(self.root, |&id| self.block(id).next)
    }

    fn free_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        iter::successors(self.first_free, |&id| self.block(id).next_free)
    }

    fn block(&self, id: BlockId) -> &Block {
        self.records.get(id)
    }

    fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.records.get_mut(id)
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut total = 0;
        let mut used = 0;
        let mut last = None;
        let mut free = Vec::new();
        let mut prev: Option<&Block> = None;

        for id in self.ids() {
            let block = self.block(id);
            assert!(block.size() > 0, "empty block in list");

            total += block.size();
            if block.is_free() {
                free.push(id);
            } else {
                used += block.size();
            }

            match prev {
                None => assert!(block.is_root(), "list does not start with a region root"),
                Some(prev) if !block.is_root() => {
                    assert_eq!(prev.end_addr(), block.start_addr(), "gap inside region");

                    if self.options.coalesce == CoalescePolicy::OnFree {
                        assert!(
                            !(prev.is_free() && block.is_free()),
                            "neighbouring free blocks were not joined"
                        );
                    }
                }
                Some(_) => {}
            }

            prev = Some(block);
            last = Some(id);
        }

        assert_eq!(total, self.total, "block sizes do not add up to total");
        assert_eq!(used, self.used, "allocated block sizes do not add up to used");
        assert_eq!(last, self.end, "end does not point at the last block");
        assert_eq!(
            self.free_ids().collect::<Vec<_>>(),
            free,
            "free chain does not match the free blocks in list order"
        );
        assert_eq!(
            iter::successors(self.spare, |&id| self.block(id).next).count(),
            self.spare_count,
            "spare chain length does not match spare count"
        );
    }
}

impl<R: RecordStore> Allocator for LinkedPool<'_, R> {
    fn allocate_raw(&mut self, count: usize, clear: bool) -> Result<NonNull<u8>> {
        self.allocate_aligned(count, 1, clear)
    }

    fn allocate_aligned(&mut self, count: usize, align: usize, clear: bool) -> Result<NonNull<u8>> {
        assert!(
            align.is_power_of_two(),
            "alignment must be a power of two, got {align}"
        );

        if count == 0 {
            return Err(Error::ZeroSize);
        }

        let mut prev_free = None;
        let mut cursor = self.first_free;

        // First free block that still holds count bytes after skipping to an aligned start.
        let (mut id, lead) = loop {
            let Some(id) = cursor else {
                trace!(count, align, "no free block is large enough");
                return Err(Error::OutOfCapacity { requested: count });
            };

            let block = self.block(id);
            let lead = block.mem().align_offset(align);

            if block.size().checked_sub(lead).is_some_and(|room| room >= count) {
                break (id, lead);
            }

            prev_free = Some(id);
            cursor = block.next_free;
        };

        if lead > 0 {
            // Obtain the records for both splits up front so a failure changes nothing.
            let room = self.block(id).size().wrapping_sub(lead);
            self.reserve_records(usize::from(room > count).wrapping_add(1))?;

            // The free head stays behind as its own block.
            let aligned = self
                .split(id, lead)?
                .expect("the lead lies strictly inside the block");

            prev_free = Some(id);
            id = aligned;
        }

        // The remainder, if any, takes this block's place in the free chain.
        self.split(id, count)?;

        let block = self.block_mut(id);
        let next_free = block.next_free;
        let mem = block.mem();
        block.set_free(false);

        self.set_next_free(prev_free, next_free);

        // Cannot overflow: bounded by total.
        self.used = self.used.wrapping_add(count);

        if clear {
            // SAFETY: The block is count bytes of memory owned by the pool and now allocated.
            unsafe {
                mem.write_bytes(0, count);
            }
        }

        trace!(count, address = mem.as_ptr().addr(), "allocated");

        Ok(mem)
    }

    fn deallocate_raw(&mut self, ptr: NonNull<u8>, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::ZeroSize);
        }

        let address = ptr.as_ptr().addr();

        let Located {
            id,
            prev,
            prev_free,
        } = self.locate(address).ok_or(Error::InvalidFree { address })?;

        let block = *self.block(id);

        if block.is_free() {
            return Err(Error::DoubleFree { address });
        }

        // Cannot underflow: the block contains the address.
        let offset = address.wrapping_sub(block.start_addr());
        let available = block.size().wrapping_sub(offset);

        if count > available {
            return Err(Error::OverRelease {
                address,
                requested: count,
                available,
            });
        }

        // Obtain the records for both splits up front so a failure changes nothing.
        let splits = usize::from(offset > 0).wrapping_add(usize::from(count < available));
        self.reserve_records(splits)?;

        let (target, target_prev) = if offset > 0 {
            let tail = self
                .split(id, offset)?
                .expect("the offset lies strictly inside the block");
            (tail, Some(id))
        } else {
            (id, prev)
        };

        self.split(target, count)?;

        // Everything between prev_free and the target is allocated, so the target goes
        // directly behind prev_free in the free chain.
        let next_free = match prev_free {
            Some(free) => self.block(free).next_free,
            None => self.first_free,
        };

        let block = self.block_mut(target);
        block.set_free(true);
        block.next_free = next_free;

        self.set_next_free(prev_free, Some(target));

        self.used = self
            .used
            .checked_sub(count)
            .expect("released bytes were counted as used");

        trace!(count, address, "released");

        if self.options.coalesce == CoalescePolicy::OnFree {
            self.join_block(target);

            if let Some(prev) = target_prev.filter(|&prev| prev_free == Some(prev)) {
                self.join_block(prev);
            }
        }

        Ok(())
    }
}

impl<R: RecordStore> MemPool for LinkedPool<'_, R> {
    fn size(&self) -> usize {
        self.total
    }

    fn used_count(&self) -> usize {
        self.used
    }

    fn has_block_for(&self, size: usize) -> bool {
        size > 0 && self.free_ids().any(|id| self.block(id).size() >= size)
    }
}

impl<R: RecordStore> Drop for LinkedPool<'_, R> {
    fn drop(&mut self) {
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && self.options.drop_policy == DropPolicy::MustNotDropAllocations
        {
            assert!(
                self.used == 0,
                "dropped a pool with {} bytes still allocated - this is forbidden by DropPolicy::MustNotDropAllocations",
                self.used
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::StackBuffer;

    assert_impl_all!(LinkedPool<'static, HeapRecords>: Send, std::fmt::Debug);
    assert_not_impl_any!(LinkedPool<'static, HeapRecords>: Sync);
    assert_impl_all!(FastLinkedPool<'static, 4>: Send);
    assert_not_impl_any!(StackPool<'static, 4>: Sync);

    fn pool(buffer: &mut [MaybeUninit<u8>]) -> LinkedPool<'_, HeapRecords> {
        LinkedPool::with_buffer(buffer).unwrap()
    }

    fn layout<R: RecordStore>(pool: &LinkedPool<'_, R>) -> Vec<(usize, bool)> {
        pool.blocks()
            .map(|block| (block.size(), block.is_free()))
            .collect()
    }

    fn at(ptr: NonNull<u8>, offset: usize) -> NonNull<u8> {
        unsafe { ptr.add(offset) }
    }

    #[test]
    fn new_pool_is_empty() {
        let pool = LinkedPool::<HeapRecords>::new();

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.block_count(), 0);
        assert!(!pool.has_block_for(1));
        pool.assert_consistent();
    }

    #[test]
    fn allocation_from_empty_pool_fails() {
        let mut pool = LinkedPool::<HeapRecords>::new();

        assert_eq!(
            pool.allocate_raw(1, false),
            Err(Error::OutOfCapacity { requested: 1 })
        );
    }

    #[test]
    fn split_leaves_exact_remainder() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(40, false).unwrap();

        assert_eq!(layout(&pool), vec![(40, false), (60, true)]);
        assert_eq!(pool.used_count(), 40);
        assert_eq!(pool.free_count(), 60);
        assert_eq!(a, pool.blocks().next().unwrap().mem());
        pool.assert_consistent();
    }

    #[test]
    fn exact_fit_leaves_no_remainder() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        _ = pool.allocate_raw(100, false).unwrap();

        assert_eq!(layout(&pool), vec![(100, false)]);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.free_block_count(), 0);
        pool.assert_consistent();
    }

    #[test]
    fn first_fit_picks_earliest_block() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(10, false).unwrap();
        let _b = pool.allocate_raw(10, false).unwrap();
        let c = pool.allocate_raw(10, false).unwrap();

        pool.deallocate_raw(c, 10).unwrap();
        pool.deallocate_raw(a, 10).unwrap();

        let d = pool.allocate_raw(5, false).unwrap();
        assert_eq!(d, a);
        pool.assert_consistent();
    }

    #[test]
    fn first_fit_skips_blocks_that_are_too_small() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(10, false).unwrap();
        let _b = pool.allocate_raw(10, false).unwrap();
        pool.deallocate_raw(a, 10).unwrap();

        let c = pool.allocate_raw(20, false).unwrap();
        assert_eq!(c, at(a, 20));
        assert_eq!(layout(&pool), vec![(10, true), (10, false), (20, false), (60, true)]);
        pool.assert_consistent();
    }

    #[test]
    fn round_trip_restores_used_count() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = pool(&mut buffer);
        let _keep = pool.allocate_raw(8, false).unwrap();
        let before = pool.used_count();

        let ptr = pool.allocate_raw(20, false).unwrap();
        pool.deallocate_raw(ptr, 20).unwrap();

        assert_eq!(pool.used_count(), before);
        pool.assert_consistent();
    }

    #[test]
    fn partial_free_in_the_middle() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(60, false).unwrap();
        pool.deallocate_raw(at(a, 20), 10).unwrap();

        assert_eq!(
            layout(&pool),
            vec![(20, false), (10, true), (30, false), (40, true)]
        );
        assert_eq!(pool.used_count(), 50);
        pool.assert_consistent();

        // The hole is the first fit for anything that fits in it.
        let b = pool.allocate_raw(10, false).unwrap();
        assert_eq!(b, at(a, 20));
        pool.assert_consistent();
    }

    #[test]
    fn partial_free_of_prefix_and_suffix() {
        let mut buffer = StackBuffer::<100>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(50, false).unwrap();

        pool.deallocate_raw(a, 10).unwrap();
        assert_eq!(layout(&pool), vec![(10, true), (40, false), (50, true)]);

        // The suffix joins the free remainder of the region.
        pool.deallocate_raw(at(a, 40), 10).unwrap();
        assert_eq!(layout(&pool), vec![(10, true), (30, false), (60, true)]);
        assert_eq!(pool.used_count(), 30);
        pool.assert_consistent();

        pool.deallocate_raw(at(a, 10), 30).unwrap();
        assert_eq!(layout(&pool), vec![(100, true)]);
        pool.assert_consistent();
    }

    #[test]
    fn partial_free_leaves_rest_untouched() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(32, false).unwrap();
        unsafe { a.write_bytes(0x5A, 32) };

        pool.deallocate_raw(at(a, 8), 8).unwrap();

        // Reuse the hole and scribble over it.
        let hole = pool.allocate_raw(8, true).unwrap();
        assert_eq!(hole, at(a, 8));

        let bytes = unsafe { std::slice::from_raw_parts(a.as_ptr(), 32) };
        assert!(bytes[..8].iter().all(|byte| *byte == 0x5A));
        assert!(bytes[8..16].iter().all(|byte| *byte == 0));
        assert!(bytes[16..].iter().all(|byte| *byte == 0x5A));
    }

    #[test]
    fn free_joins_both_neighbours() {
        let mut buffer = StackBuffer::<30>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(10, false).unwrap();
        let b = pool.allocate_raw(10, false).unwrap();
        let c = pool.allocate_raw(10, false).unwrap();

        pool.deallocate_raw(a, 10).unwrap();
        pool.deallocate_raw(c, 10).unwrap();
        assert_eq!(pool.block_count(), 3);

        pool.deallocate_raw(b, 10).unwrap();
        assert_eq!(layout(&pool), vec![(30, true)]);
        assert!(pool.has_block_for(30));
        pool.assert_consistent();
    }

    #[test]
    fn manual_coalescing_defers_joins() {
        let mut buffer = StackBuffer::<30>::new();
        let mut pool = LinkedPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .coalesce(CoalescePolicy::Manual)
            .build()
            .unwrap();

        let a = pool.allocate_raw(10, false).unwrap();
        let b = pool.allocate_raw(10, false).unwrap();
        pool.deallocate_raw(a, 10).unwrap();
        pool.deallocate_raw(b, 10).unwrap();

        assert_eq!(layout(&pool), vec![(10, true), (10, true), (10, true)]);
        assert!(!pool.has_block_for(30));
        assert_eq!(pool.free_count(), 30);
        pool.assert_consistent();

        assert_eq!(pool.join_free_blocks(), 2);
        assert_eq!(layout(&pool), vec![(30, true)]);
        assert_eq!(pool.join_free_blocks(), 0);
        pool.assert_consistent();
    }

    #[test]
    fn joins_never_cross_regions() {
        let mut first = StackBuffer::<16>::new();
        let mut second = StackBuffer::<16>::new();
        let mut pool = pool(&mut first);
        pool.seed(&mut second).unwrap();

        assert_eq!(pool.region_count(), 2);
        assert_eq!(pool.size(), 32);
        assert_eq!(pool.join_free_blocks(), 0);
        assert!(!pool.has_block_for(17));
        assert_eq!(pool.largest_free_block(), 16);

        let a = pool.allocate_raw(16, false).unwrap();
        let b = pool.allocate_raw(16, false).unwrap();
        pool.deallocate_raw(b, 16).unwrap();
        pool.deallocate_raw(a, 16).unwrap();

        assert_eq!(layout(&pool), vec![(16, true), (16, true)]);
        pool.assert_consistent();
    }

    #[test]
    fn release_errors_leave_pool_unchanged() {
        let mut buffer = StackBuffer::<64>::new();
        let mut outside = StackBuffer::<8>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(16, false).unwrap();
        let b = pool.allocate_raw(16, false).unwrap();
        pool.deallocate_raw(b, 16).unwrap();
        let before = layout(&pool);

        let stranger = NonNull::from(&mut *outside).cast::<u8>();
        assert_eq!(
            pool.deallocate_raw(stranger, 1),
            Err(Error::InvalidFree {
                address: stranger.as_ptr().addr()
            })
        );

        assert_eq!(
            pool.deallocate_raw(b, 16),
            Err(Error::DoubleFree {
                address: b.as_ptr().addr()
            })
        );

        // Inside the free tail, not at its start.
        assert!(matches!(
            pool.deallocate_raw(at(b, 3), 1),
            Err(Error::DoubleFree { .. })
        ));

        assert_eq!(
            pool.deallocate_raw(at(a, 4), 16),
            Err(Error::OverRelease {
                address: at(a, 4).as_ptr().addr(),
                requested: 16,
                available: 12,
            })
        );

        assert_eq!(pool.deallocate_raw(a, 0), Err(Error::ZeroSize));

        assert_eq!(layout(&pool), before);
        assert_eq!(pool.used_count(), 16);
        pool.assert_consistent();
    }

    #[test]
    fn release_cannot_span_two_allocations() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(16, false).unwrap();
        let _b = pool.allocate_raw(16, false).unwrap();

        assert!(matches!(
            pool.deallocate_raw(a, 32),
            Err(Error::OverRelease { available: 16, .. })
        ));
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        let mut buffer = StackBuffer::<8>::new();
        let mut empty = StackBuffer::<0>::new();
        let mut pool = pool(&mut buffer);

        assert_eq!(pool.allocate_raw(0, false), Err(Error::ZeroSize));
        assert!(!pool.has_block_for(0));

        assert_eq!(pool.seed(&mut empty), Err(Error::ZeroSize));
        assert_eq!(pool.region_count(), 1);
    }

    #[test]
    fn clear_zero_fills() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = pool(&mut buffer);

        let dirty = pool.allocate_raw(32, false).unwrap();
        unsafe { dirty.write_bytes(0xFF, 32) };
        pool.deallocate_raw(dirty, 32).unwrap();

        let clean = pool.allocate_raw(32, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(clean.as_ptr(), 32) };
        assert!(bytes.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn record_exhaustion_fails_cleanly() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = StackPool::<1>::with_buffer(&mut buffer).unwrap();

        // A partial allocation needs a second record for the remainder.
        assert_eq!(pool.allocate_raw(10, false), Err(Error::RecordsExhausted));
        assert_eq!(layout(&pool), vec![(32, true)]);
        assert_eq!(pool.used_count(), 0);

        // An exact fit needs no new record.
        let all = pool.allocate_raw(32, false).unwrap();

        // Neither does releasing all of it, but releasing part of it does.
        assert_eq!(pool.deallocate_raw(at(all, 8), 8), Err(Error::RecordsExhausted));
        assert_eq!(layout(&pool), vec![(32, false)]);

        pool.deallocate_raw(all, 32).unwrap();
        assert!(pool.is_empty());
        pool.assert_consistent();
    }

    #[test]
    fn partial_release_needing_two_records_is_all_or_nothing() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = StackPool::<2>::with_buffer(&mut buffer).unwrap();

        let all = pool.allocate_raw(32, false).unwrap();

        // Releasing the middle needs two more records but only one is left.
        assert_eq!(pool.deallocate_raw(at(all, 8), 8), Err(Error::RecordsExhausted));
        assert_eq!(layout(&pool), vec![(32, false)]);
        pool.assert_consistent();
    }

    #[test]
    fn spare_records_are_capped() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .max_spare_records(1)
            .build()
            .unwrap();

        let ptrs: Vec<_> = (0..4)
            .map(|_| pool.allocate_raw(8, false).unwrap())
            .collect();
        assert_eq!(pool.records().len(), 5);

        for ptr in ptrs {
            pool.deallocate_raw(ptr, 8).unwrap();
        }

        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.spare_record_count(), 1);
        assert_eq!(pool.records().len(), 2);
        pool.assert_consistent();
    }

    #[test]
    fn reserved_records_are_used_before_the_store() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = pool(&mut buffer);

        pool.reserve_records(4).unwrap();
        assert_eq!(pool.spare_record_count(), 4);

        pool.reserve_records(2).unwrap();
        assert_eq!(pool.spare_record_count(), 4);

        pool.reserve_more_records(2).unwrap();
        assert_eq!(pool.spare_record_count(), 6);
        assert_eq!(pool.records().len(), 7);

        _ = pool.allocate_raw(8, false).unwrap();
        assert_eq!(pool.spare_record_count(), 5);
        assert_eq!(pool.records().len(), 7);
        pool.assert_consistent();
    }

    #[test]
    fn reserve_more_records_reports_exhaustion() {
        let mut pool = StackPool::<2>::new();

        assert_eq!(pool.reserve_more_records(3), Err(Error::RecordsExhausted));
        assert_eq!(pool.spare_record_count(), 2);
    }

    #[test]
    fn contains_covers_free_and_allocated_memory() {
        let mut buffer = StackBuffer::<16>::new();
        let mut outside = StackBuffer::<16>::new();
        let mut pool = pool(&mut buffer);

        let a = pool.allocate_raw(4, false).unwrap();

        assert!(pool.contains(a));
        assert!(pool.contains(at(a, 15)));
        assert!(!pool.contains(NonNull::from(&mut *outside).cast()));
    }

    #[test]
    fn add_memory_appends_region() {
        let mut raw = vec![0_u8; 24];
        let mut pool = LinkedPool::<HeapRecords>::new();

        let mem = NonNull::new(raw.as_mut_ptr()).unwrap();
        unsafe { pool.add_memory(mem, raw.len()) }.unwrap();

        assert_eq!(pool.size(), 24);
        assert_eq!(pool.blocks().next().unwrap().origin(), Some(RegionOrigin::Seeded));

        let ptr = pool.allocate_raw(24, false).unwrap();
        assert_eq!(ptr, mem);
        pool.deallocate_raw(ptr, 24).unwrap();
        drop(pool);
    }

    #[test]
    fn mixed_sequence_stays_consistent() {
        let mut buffer = StackBuffer::<256>::new();
        let mut pool = pool(&mut buffer);

        let mut live = Vec::new();
        for round in 1..=12_usize {
            let size = round * 3 % 17 + 1;
            if let Ok(ptr) = pool.allocate_raw(size, false) {
                live.push((ptr, size));
            }
            pool.assert_consistent();

            if round % 3 == 0 {
                let (ptr, size) = live.remove(live.len() / 2);
                pool.deallocate_raw(ptr, size).unwrap();
                pool.assert_consistent();
            }
        }

        for (ptr, size) in live {
            pool.deallocate_raw(ptr, size).unwrap();
            pool.assert_consistent();
        }

        assert_eq!(layout(&pool), vec![(256, true)]);
    }

    #[test]
    #[should_panic]
    fn must_not_drop_allocations_panics() {
        let mut buffer = StackBuffer::<16>::new();
        let mut pool = LinkedPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build()
            .unwrap();

        _ = pool.allocate_raw(4, false).unwrap();
    }

    #[test]
    fn must_not_drop_allocations_accepts_empty_pool() {
        let mut buffer = StackBuffer::<16>::new();
        let mut pool = LinkedPool::<HeapRecords>::builder()
            .seed(&mut buffer)
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build()
            .unwrap();

        let ptr = pool.allocate_raw(4, false).unwrap();
        pool.deallocate_raw(ptr, 4).unwrap();
    }

    #[test]
    fn drain_reports_whole_regions() {
        let mut first = StackBuffer::<32>::new();
        let mut second = StackBuffer::<16>::new();
        let mut pool = pool(&mut first);
        pool.seed(&mut second).unwrap();

        _ = pool.allocate_raw(5, false).unwrap();
        _ = pool.allocate_raw(7, false).unwrap();

        let mut drained = Vec::new();
        pool.drain_regions(|_, size, origin| drained.push((size, origin)));

        assert_eq!(
            drained,
            vec![(32, RegionOrigin::Seeded), (16, RegionOrigin::Seeded)]
        );
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.block_count(), 0);
    }
}
