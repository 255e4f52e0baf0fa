use std::ptr::NonNull;

/// Identifies a bookkeeping record inside a [`RecordStore`][crate::RecordStore].
///
/// Record stores hand these out from [`acquire()`][crate::RecordStore::acquire] and the pool
/// uses them to link blocks together instead of pointers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockId(usize);

impl BlockId {
    /// Creates an identifier from the index a record store uses for the record.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index a record store uses for the record.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// How the memory of a region came to be owned by a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RegionOrigin {
    /// Supplied by the owner of the pool, either as a borrowed buffer or as raw memory.
    /// The pool never releases seeded regions.
    Seeded,

    /// Obtained from a [`MemorySource`][crate::MemorySource] and returned to it when the region
    /// becomes idle and the pool shrinks, or when the pool is dropped.
    Grown,
}

/// Describes one contiguous span of pool-managed memory.
///
/// Every block in a pool is either free or allocated. Allocated blocks are exactly the spans
/// handed out by the pool (or what remains of them after partial deallocation). The first block
/// of each region is its root.
#[derive(Clone, Copy, Debug)]
pub struct Block {
    mem: NonNull<u8>,
    size: usize,
    is_free: bool,

    /// `Some` only for the root block of a region.
    origin: Option<RegionOrigin>,

    pub(crate) next: Option<BlockId>,

    /// Next block in the free chain. Only meaningful while `is_free`.
    pub(crate) next_free: Option<BlockId>,
}

impl Block {
    /// Contents of a record that does not currently describe any memory.
    pub const VACANT: Self = Self {
        mem: NonNull::dangling(),
        size: 0,
        is_free: false,
        origin: None,
        next: None,
        next_free: None,
    };

    pub(crate) fn root(mem: NonNull<u8>, size: usize, origin: RegionOrigin) -> Self {
        Self {
            mem,
            size,
            is_free: true,
            origin: Some(origin),
            next: None,
            next_free: None,
        }
    }

    /// A record kept aside for reuse, linked to the next spare record.
    pub(crate) fn spare(next: Option<BlockId>) -> Self {
        Self {
            next,
            ..Self::VACANT
        }
    }

    /// The first byte of the span.
    #[must_use]
    pub fn mem(&self) -> NonNull<u8> {
        self.mem
    }

    /// The length of the span in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the span is available for allocation.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.is_free
    }

    /// Whether this is the first block of a region.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.origin.is_some()
    }

    /// Where the region started by this block came from, if this is a root block.
    #[must_use]
    pub fn origin(&self) -> Option<RegionOrigin> {
        self.origin
    }

    pub(crate) fn start_addr(&self) -> usize {
        self.mem.as_ptr().addr()
    }

    pub(crate) fn end_addr(&self) -> usize {
        // Cannot overflow: the span lies within one allocated object.
        self.start_addr().wrapping_add(self.size)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start_addr() && addr < self.end_addr()
    }

    pub(crate) fn set_free(&mut self, is_free: bool) {
        self.is_free = is_free;
        if !is_free {
            self.next_free = None;
        }
    }

    /// Splits off everything past the first `size` bytes and returns a block describing it.
    ///
    /// The tail inherits the free state and the links of `self`; the caller splices it in.
    pub(crate) fn cut(&mut self, size: usize) -> Self {
        assert!(
            size > 0 && size < self.size,
            "cannot cut a {} byte block at offset {size}",
            self.size
        );

        // SAFETY: `size` is strictly inside the span, so the result stays within the same
        // allocated object as `self.mem`.
        let tail_mem = unsafe { self.mem.add(size) };

        let tail = Self {
            mem: tail_mem,
            size: self.size.wrapping_sub(size),
            is_free: self.is_free,
            origin: None,
            next: self.next,
            next_free: if self.is_free { self.next_free } else { None },
        };

        self.size = size;
        tail
    }

    /// Absorbs `next`, which must directly follow `self` in memory.
    pub(crate) fn absorb(&mut self, next: &Self) {
        assert_eq!(
            self.end_addr(),
            next.start_addr(),
            "block list corrupted: neighbouring blocks in one region are not contiguous"
        );

        self.size = self
            .size
            .checked_add(next.size)
            .expect("joined blocks lie within one region so their size fits in usize");
        self.next = next.next;
        self.next_free = next.next_free;
    }
}

// SAFETY: A `Block` only describes memory; it never reads or writes through `mem`. The pool that
// owns the record decides who may touch the memory, and pools are only used through `&mut self`.
unsafe impl Send for Block {}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;

    fn region(buffer: &mut [MaybeUninit<u8>]) -> Block {
        let mem = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        Block::root(mem, buffer.len(), RegionOrigin::Seeded)
    }

    #[test]
    fn cut_produces_adjacent_tail() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 64];
        let mut block = region(&mut buffer);

        let tail = block.cut(24);

        assert_eq!(block.size(), 24);
        assert_eq!(tail.size(), 40);
        assert_eq!(block.end_addr(), tail.start_addr());
        assert!(tail.is_free());
        assert!(!tail.is_root());
        assert!(block.is_root());
    }

    #[test]
    fn absorb_restores_cut() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 64];
        let mut block = region(&mut buffer);

        let tail = block.cut(10);
        block.absorb(&tail);

        assert_eq!(block.size(), 64);
    }

    #[test]
    #[should_panic]
    fn absorb_of_distant_block_panics() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 64];
        let mut block = region(&mut buffer);

        let mut tail = block.cut(10);
        let far = tail.cut(10);

        block.absorb(&far);
    }

    #[test]
    #[should_panic]
    fn cut_at_zero_panics() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 8];
        let mut block = region(&mut buffer);

        _ = block.cut(0);
    }

    #[test]
    fn contains_is_half_open() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 8];
        let block = region(&mut buffer);

        assert!(block.contains(block.start_addr()));
        assert!(block.contains(block.end_addr() - 1));
        assert!(!block.contains(block.end_addr()));
    }

    #[test]
    fn allocated_block_leaves_free_chain() {
        let mut buffer = [MaybeUninit::<u8>::uninit(); 8];
        let mut block = region(&mut buffer);
        block.next_free = Some(BlockId::new(3));

        block.set_free(false);

        assert!(block.next_free.is_none());
    }
}
