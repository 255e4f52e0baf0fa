use std::fmt::Debug;

use crate::{Block, BlockId};

/// Supplies the bookkeeping records that describe the blocks of a pool.
///
/// Records are kept apart from the memory the pool manages: a pool never allocates its own
/// records through itself, so the first allocation from a pool does not depend on the pool
/// already having a record to spare.
///
/// Implementations decide where records live. [`HeapRecords`] keeps them in a growable slab,
/// [`CachedRecords`][crate::CachedRecords] keeps a fixed number inside the pool object itself
/// and [`NoRecords`] refuses to supply any.
///
/// # Panics
///
/// [`release()`][Self::release], [`get()`][Self::get] and [`get_mut()`][Self::get_mut] may panic
/// if given an identifier that the store did not hand out or that was already released. The
/// pool never does this unless its block list has been corrupted.
pub trait RecordStore: Debug {
    /// Stores `block` in a fresh record and returns its identifier, or `None` if no record
    /// can be obtained.
    fn acquire(&mut self, block: Block) -> Option<BlockId>;

    /// Returns a record to the store. The identifier must not be used afterwards.
    fn release(&mut self, id: BlockId);

    /// The block described by a live record.
    fn get(&self, id: BlockId) -> &Block;

    /// The block described by a live record.
    fn get_mut(&mut self, id: BlockId) -> &mut Block;
}

/// Keeps records in a heap-allocated slab that grows as needed.
///
/// Released records are threaded into a vacancy chain and reused before the slab grows again.
/// The slab itself never shrinks while the store is alive.
#[derive(Debug, Default)]
pub struct HeapRecords {
    entries: Vec<Entry>,

    /// Index of the most recently released entry. Points past the end of `entries` when there
    /// is no vacant entry.
    next_vacant_index: usize,

    live: usize,
}

#[derive(Debug)]
enum Entry {
    Occupied(Block),

    Vacant { next_vacant_index: usize },
}

impl HeapRecords {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of records currently handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no records are currently handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// The number of records the slab can hold without growing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    fn occupied(&self, id: BlockId) -> &Block {
        match self.entries.get(id.index()) {
            Some(Entry::Occupied(block)) => block,
            Some(Entry::Vacant { .. }) => panic!("record {} is vacant", id.index()),
            None => panic!(
                "record {} is out of bounds in a store of {} records",
                id.index(),
                self.entries.len()
            ),
        }
    }
}

impl RecordStore for HeapRecords {
    fn acquire(&mut self, block: Block) -> Option<BlockId> {
        let index = self.next_vacant_index;

        if let Some(entry) = self.entries.get_mut(index) {
            let Entry::Vacant { next_vacant_index } = *entry else {
                panic!("vacancy chain points at occupied record {index}");
            };

            *entry = Entry::Occupied(block);
            self.next_vacant_index = next_vacant_index;
        } else {
            // A failed reservation is reported to the pool as record exhaustion instead of
            // aborting the process.
            self.entries.try_reserve(1).ok()?;
            self.entries.push(Entry::Occupied(block));

            // The vacancy chain is empty, so it keeps pointing past the end.
            self.next_vacant_index = self.entries.len();
        }

        // Cannot overflow: every live record occupies a slab entry.
        self.live = self.live.wrapping_add(1);

        Some(BlockId::new(index))
    }

    fn release(&mut self, id: BlockId) {
        let next_vacant_index = self.next_vacant_index;

        match self.entries.get_mut(id.index()) {
            Some(entry @ Entry::Occupied(_)) => {
                *entry = Entry::Vacant { next_vacant_index };
            }
            _ => panic!("released record {} was not handed out", id.index()),
        }

        self.next_vacant_index = id.index();
        self.live = self
            .live
            .checked_sub(1)
            .expect("an occupied entry implies at least one live record");
    }

    fn get(&self, id: BlockId) -> &Block {
        self.occupied(id)
    }

    fn get_mut(&mut self, id: BlockId) -> &mut Block {
        let len = self.entries.len();

        match self.entries.get_mut(id.index()) {
            Some(Entry::Occupied(block)) => block,
            Some(Entry::Vacant { .. }) => panic!("record {} is vacant", id.index()),
            None => panic!(
                "record {} is out of bounds in a store of {len} records",
                id.index()
            ),
        }
    }
}

/// A record store that never supplies a record.
///
/// Used as the fallback of a [`CachedRecords`][crate::CachedRecords] when a pool must never
/// touch the heap: once the in-object cache is exhausted, splits fail with
/// [`Error::RecordsExhausted`][crate::Error::RecordsExhausted].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRecords;

impl RecordStore for NoRecords {
    #[cfg_attr(test, mutants::skip)] // There is no storage, so no other result exists.
    fn acquire(&mut self, _block: Block) -> Option<BlockId> {
        None
    }

    fn release(&mut self, id: BlockId) {
        panic!("NoRecords never hands out records, yet record {} was released", id.index());
    }

    fn get(&self, id: BlockId) -> &Block {
        panic!("NoRecords never hands out records, yet record {} was read", id.index());
    }

    fn get_mut(&mut self, id: BlockId) -> &mut Block {
        panic!("NoRecords never hands out records, yet record {} was read", id.index());
    }
}
