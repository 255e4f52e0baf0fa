use crate::{Block, BlockId, HeapRecords, RecordStore};

/// Keeps the first `N` records in a fixed array inside the object and only falls back to
/// another store (by default [`HeapRecords`]) once all of them are in use.
///
/// A pool built on this store describes its first `N` concurrently live blocks without any call
/// reaching the fallback, which bounds the latency of those operations and lets a pool work
/// before any heap is available at all (see [`NoRecords`][crate::NoRecords]).
///
/// Identifiers `0..N` refer to the cache. The fallback's identifiers are shifted up by `N`.
///
/// # Examples
///
/// ```
/// use block_pool::{Block, CachedRecords, RecordStore};
///
/// let mut records = CachedRecords::<2>::new();
///
/// let a = records.acquire(Block::VACANT).unwrap();
/// let b = records.acquire(Block::VACANT).unwrap();
/// assert_eq!(records.cached_len(), 2);
///
/// // The cache is full, so this one comes from the heap.
/// let c = records.acquire(Block::VACANT).unwrap();
/// assert_eq!(records.fallback().len(), 1);
/// # records.release(a);
/// # records.release(b);
/// # records.release(c);
/// ```
#[derive(Debug)]
pub struct CachedRecords<const N: usize, F = HeapRecords> {
    slots: [Block; N],

    /// Which slots are handed out. Parallel to `slots`.
    in_use: [bool; N],

    /// Lowest slot that is not in use, or `None` if the cache is full.
    first_free_index: Option<usize>,

    cached_len: usize,

    fallback: F,
}

impl<const N: usize, F: RecordStore> CachedRecords<N, F> {
    /// Creates a cache in front of the given fallback store.
    #[must_use]
    pub fn with_fallback(fallback: F) -> Self {
        Self {
            slots: [Block::VACANT; N],
            in_use: [false; N],
            first_free_index: if N > 0 { Some(0) } else { None },
            cached_len: 0,
            fallback,
        }
    }

    /// The number of in-object slots.
    #[must_use]
    pub const fn cache_capacity(&self) -> usize {
        N
    }

    /// The number of in-object slots currently handed out.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cached_len
    }

    /// The store used once the in-object slots are exhausted.
    #[must_use]
    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    fn slot_index(id: BlockId) -> Option<usize> {
        (id.index() < N).then_some(id.index())
    }

    fn fallback_id(id: BlockId) -> BlockId {
        // Only called for identifiers at or above N.
        BlockId::new(id.index().wrapping_sub(N))
    }

    fn next_free_after(&self, index: usize) -> Option<usize> {
        // Cannot overflow: index < N.
        let start = index.wrapping_add(1);

        self.in_use
            .get(start..)
            .and_then(|rest| rest.iter().position(|used| !used))
            .map(|offset| start.wrapping_add(offset))
    }
}

impl<const N: usize, F: RecordStore + Default> CachedRecords<N, F> {
    /// Creates a cache in front of a default fallback store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fallback(F::default())
    }
}

impl<const N: usize, F: RecordStore + Default> Default for CachedRecords<N, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, F: RecordStore> RecordStore for CachedRecords<N, F> {
    fn acquire(&mut self, block: Block) -> Option<BlockId> {
        let Some(index) = self.first_free_index else {
            let id = self.fallback.acquire(block)?;

            return Some(BlockId::new(id.index().checked_add(N).expect(
                "fallback record identifiers stay far below usize::MAX",
            )));
        };

        *self
            .slots
            .get_mut(index)
            .expect("cursor always points inside the cache") = block;
        *self
            .in_use
            .get_mut(index)
            .expect("cursor always points inside the cache") = true;

        // Cannot overflow: bounded by N.
        self.cached_len = self.cached_len.wrapping_add(1);
        self.first_free_index = self.next_free_after(index);

        Some(BlockId::new(index))
    }

    fn release(&mut self, id: BlockId) {
        let Some(index) = Self::slot_index(id) else {
            self.fallback.release(Self::fallback_id(id));
            return;
        };

        let in_use = self
            .in_use
            .get_mut(index)
            .expect("guarded by slot_index bounds check");
        assert!(*in_use, "released cached record {index} was not handed out");
        *in_use = false;

        *self
            .slots
            .get_mut(index)
            .expect("guarded by slot_index bounds check") = Block::VACANT;

        self.cached_len = self
            .cached_len
            .checked_sub(1)
            .expect("a slot in use implies a positive count");

        if self.first_free_index.is_none_or(|first| index < first) {
            self.first_free_index = Some(index);
        }
    }

    fn get(&self, id: BlockId) -> &Block {
        match Self::slot_index(id) {
            Some(index) => {
                assert!(
                    self.in_use.get(index).copied().unwrap_or_default(),
                    "cached record {index} is vacant"
                );
                self.slots.get(index).expect("guarded by slot_index bounds check")
            }
            None => self.fallback.get(Self::fallback_id(id)),
        }
    }

    fn get_mut(&mut self, id: BlockId) -> &mut Block {
        match Self::slot_index(id) {
            Some(index) => {
                assert!(
                    self.in_use.get(index).copied().unwrap_or_default(),
                    "cached record {index} is vacant"
                );
                self.slots
                    .get_mut(index)
                    .expect("guarded by slot_index bounds check")
            }
            None => self.fallback.get_mut(Self::fallback_id(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::NoRecords;

    assert_impl_all!(CachedRecords<4>: Send, std::fmt::Debug, Default);

    #[test]
    fn serves_cache_before_fallback() {
        let mut records = CachedRecords::<3>::new();

        let ids: Vec<_> = (0..3)
            .map(|_| records.acquire(Block::VACANT).unwrap())
            .collect();

        assert_eq!(
            ids.iter().map(|id| id.index()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(records.cached_len(), 3);
        assert!(records.fallback().is_empty());

        let spilled = records.acquire(Block::VACANT).unwrap();
        assert_eq!(spilled.index(), 3);
        assert_eq!(records.fallback().len(), 1);
    }

    #[test]
    fn release_moves_cursor_back_to_earliest_slot() {
        let mut records = CachedRecords::<4>::new();

        let a = records.acquire(Block::VACANT).unwrap();
        let b = records.acquire(Block::VACANT).unwrap();
        let c = records.acquire(Block::VACANT).unwrap();

        records.release(c);
        records.release(a);

        // The earliest free slot wins.
        assert_eq!(records.acquire(Block::VACANT), Some(a));

        // Then the scan skips b, which is still in use.
        assert_eq!(records.acquire(Block::VACANT), Some(c));
        assert_eq!(records.acquire(Block::VACANT).unwrap().index(), 3);

        records.release(b);
        assert_eq!(records.acquire(Block::VACANT), Some(b));
    }

    #[test]
    fn acquire_never_overwrites_a_live_slot() {
        let mut records = CachedRecords::<4>::new();

        let marker = |tag: usize| Block::spare(Some(BlockId::new(tag)));

        let ids: Vec<_> = (0..4)
            .map(|tag| records.acquire(marker(tag)).unwrap())
            .collect();

        records.release(ids[1]);
        let refilled = records.acquire(marker(10)).unwrap();
        assert_eq!(refilled, ids[1]);

        // The cache is full again, so the next record must not land on any slot.
        let spilled = records.acquire(marker(20)).unwrap();
        assert!(spilled.index() >= 4);

        assert_eq!(records.get(ids[0]).next, Some(BlockId::new(0)));
        assert_eq!(records.get(refilled).next, Some(BlockId::new(10)));
        assert_eq!(records.get(ids[2]).next, Some(BlockId::new(2)));
        assert_eq!(records.get(ids[3]).next, Some(BlockId::new(3)));
        assert_eq!(records.get(spilled).next, Some(BlockId::new(20)));
    }

    #[test]
    fn fallback_ids_round_trip() {
        let mut records = CachedRecords::<1>::new();

        let cached = records.acquire(Block::VACANT).unwrap();
        let spilled = records.acquire(Block::VACANT).unwrap();

        records.get_mut(spilled).next = Some(cached);
        assert_eq!(records.get(spilled).next, Some(cached));

        records.release(spilled);
        assert!(records.fallback().is_empty());
        assert_eq!(records.cached_len(), 1);
    }

    #[test]
    fn without_fallback_runs_dry() {
        let mut records = CachedRecords::<2, NoRecords>::new();

        assert!(records.acquire(Block::VACANT).is_some());
        assert!(records.acquire(Block::VACANT).is_some());
        assert!(records.acquire(Block::VACANT).is_none());
    }

    #[test]
    fn zero_capacity_goes_straight_to_fallback() {
        let mut records = CachedRecords::<0>::new();

        let id = records.acquire(Block::VACANT).unwrap();

        assert_eq!(id.index(), 0);
        assert_eq!(records.cached_len(), 0);
        assert_eq!(records.fallback().len(), 1);
    }

    #[test]
    #[should_panic]
    fn releasing_vacant_slot_panics() {
        let mut records = CachedRecords::<2>::new();
        records.release(BlockId::new(1));
    }
}
