use std::alloc::Layout;
use std::ptr::{self, NonNull};

use scopeguard::ScopeGuard;

use crate::{Error, Result};

/// The allocation contract every pool implements.
///
/// Implementors provide two raw primitives, [`allocate_raw()`][Self::allocate_raw] and
/// [`deallocate_raw()`][Self::deallocate_raw]. Everything else is built on top of them.
///
/// Implementations must support partial deallocation: releasing any sub-range of a live
/// allocation returns just that sub-range to the pool and leaves the rest allocated. The
/// provided [`allocate_aligned()`][Self::allocate_aligned] relies on this to trim padding.
///
/// # Examples
///
/// ```
/// use block_pool::{Allocator, HeapPool};
///
/// let mut pool = HeapPool::<8>::builder().initial_capacity(256).build().unwrap();
///
/// let numbers = pool.construct_multiple(4, |index| index as u64 * 10).unwrap();
///
/// // SAFETY: construct_multiple() initialized four values.
/// let third = unsafe { numbers.add(2).read() };
/// assert_eq!(third, 20);
///
/// // SAFETY: The values are not used after this.
/// unsafe { pool.destruct(numbers, 4).unwrap() };
/// ```
pub trait Allocator {
    /// Allocates `count` bytes, zeroing them if `clear` is set.
    ///
    /// The returned memory has no particular alignment.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroSize`] if `count` is zero, [`Error::OutOfCapacity`] if no free block is
    /// large enough, [`Error::RecordsExhausted`] if the bookkeeping for the allocation could not
    /// be obtained. Growable pools may also report [`Error::OutOfMemory`].
    fn allocate_raw(&mut self, count: usize, clear: bool) -> Result<NonNull<u8>>;

    /// Releases `count` bytes starting at `ptr`.
    ///
    /// The range may be any sub-range of a live allocation.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroSize`] if `count` is zero, [`Error::InvalidFree`] if `ptr` is not inside
    /// this pool, [`Error::DoubleFree`] if it is inside a free block, [`Error::OverRelease`] if
    /// the range runs past the allocation and [`Error::RecordsExhausted`] if the bookkeeping
    /// for a partial release could not be obtained.
    fn deallocate_raw(&mut self, ptr: NonNull<u8>, count: usize) -> Result<()>;

    /// Allocates `count` bytes starting at an address that is a multiple of `align`.
    ///
    /// The provided implementation takes a plain allocation if it happens to be aligned.
    /// Otherwise it allocates `count + align - 1` bytes and releases the padding on both sides
    /// through partial deallocation. Pools that can see their free blocks should override it
    /// and pick an aligned span directly.
    ///
    /// # Errors
    ///
    /// As [`allocate_raw()`][Self::allocate_raw], plus [`Error::SizeOverflow`] if the padded
    /// request does not fit in `usize`. [`Error::OutOfCapacity`] reports `count`.
    ///
    /// # Panics
    ///
    /// If `align` is not a power of two.
    fn allocate_aligned(&mut self, count: usize, align: usize, clear: bool) -> Result<NonNull<u8>> {
        assert!(
            align.is_power_of_two(),
            "alignment must be a power of two, got {align}"
        );

        let raw = self.allocate_raw(count, clear)?;

        if raw.align_offset(align) == 0 {
            return Ok(raw);
        }

        // Releasing a whole allocation never needs bookkeeping.
        self.deallocate_raw(raw, count)?;

        // Room to slide the start forward to an aligned address.
        let padded = count
            .checked_add(align.wrapping_sub(1))
            .ok_or(Error::SizeOverflow)?;

        let raw = self
            .allocate_raw(padded, clear)
            .map_err(|error| match error {
                Error::OutOfCapacity { .. } => Error::OutOfCapacity { requested: count },
                error => error,
            })?;

        let lead = raw.align_offset(align);
        assert!(lead < align, "an aligned address exists within align bytes");

        // Cannot overflow: lead < align, so lead + count <= padded.
        let trail = padded.wrapping_sub(lead).wrapping_sub(count);

        // SAFETY: lead < align, so the aligned start stays within the padded allocation.
        let aligned = unsafe { raw.add(lead) };

        if lead > 0 {
            if let Err(error) = self.deallocate_raw(raw, lead) {
                _ = self.deallocate_raw(raw, padded);
                return Err(error);
            }
        }

        if trail > 0 {
            // SAFETY: aligned + count is at most the end of the padded allocation.
            let tail = unsafe { aligned.add(count) };

            if let Err(error) = self.deallocate_raw(tail, trail) {
                // Cannot overflow: lead + count + trail == padded.
                _ = self.deallocate_raw(aligned, count.wrapping_add(trail));
                return Err(error);
            }
        }

        Ok(aligned)
    }

    /// Allocates memory that satisfies `layout`.
    ///
    /// Zero-sized layouts are served with a dangling, well-aligned pointer without touching the
    /// pool.
    ///
    /// # Errors
    ///
    /// As [`allocate_aligned()`][Self::allocate_aligned].
    fn allocate_layout(&mut self, layout: Layout, clear: bool) -> Result<NonNull<u8>>
    where
        Self: Sized,
    {
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }

        self.allocate_aligned(layout.size(), layout.align(), clear)
    }

    /// Releases memory obtained from [`allocate_layout()`][Self::allocate_layout] with the same
    /// layout.
    ///
    /// # Errors
    ///
    /// As [`deallocate_raw()`][Self::deallocate_raw].
    fn deallocate_layout(&mut self, ptr: NonNull<u8>, layout: Layout) -> Result<()>
    where
        Self: Sized,
    {
        if layout.size() == 0 {
            return Ok(());
        }

        self.deallocate_raw(ptr, layout.size())
    }

    /// Allocates uninitialized memory for `count` values of type `T`.
    ///
    /// # Errors
    ///
    /// As [`allocate_layout()`][Self::allocate_layout].
    fn allocate<T>(&mut self, count: usize) -> Result<NonNull<T>>
    where
        Self: Sized,
    {
        let layout = Layout::array::<T>(count).map_err(|_layout_error| Error::SizeOverflow)?;
        self.allocate_layout(layout, false).map(NonNull::cast)
    }

    /// Allocates zeroed memory for `count` values of type `T`.
    ///
    /// # Errors
    ///
    /// As [`allocate_layout()`][Self::allocate_layout].
    fn allocate_zeroed<T>(&mut self, count: usize) -> Result<NonNull<T>>
    where
        Self: Sized,
    {
        let layout = Layout::array::<T>(count).map_err(|_layout_error| Error::SizeOverflow)?;
        self.allocate_layout(layout, true).map(NonNull::cast)
    }

    /// Releases memory obtained from [`allocate()`][Self::allocate] without dropping anything.
    ///
    /// A prefix or suffix of the allocation may be released by passing a pointer into it and a
    /// smaller count.
    ///
    /// # Errors
    ///
    /// As [`deallocate_raw()`][Self::deallocate_raw].
    fn deallocate<T>(&mut self, ptr: NonNull<T>, count: usize) -> Result<()>
    where
        Self: Sized,
    {
        let layout = Layout::array::<T>(count).map_err(|_layout_error| Error::SizeOverflow)?;
        self.deallocate_layout(ptr.cast(), layout)
    }

    /// Allocates memory for one `T` and moves `value` into it.
    ///
    /// # Errors
    ///
    /// As [`allocate()`][Self::allocate]. The value is dropped on failure.
    fn construct<T>(&mut self, value: T) -> Result<NonNull<T>>
    where
        Self: Sized,
    {
        let ptr = self.allocate::<T>(1)?;

        // SAFETY: The memory was just allocated for one T, is aligned and is not aliased.
        unsafe {
            ptr.write(value);
        }

        Ok(ptr)
    }

    /// Allocates memory for `count` values and initializes each in place with `init(index)`.
    ///
    /// If `init` panics, the values built so far are dropped and the memory is released before
    /// the panic continues.
    ///
    /// # Errors
    ///
    /// As [`allocate()`][Self::allocate].
    fn construct_multiple<T, F>(&mut self, count: usize, mut init: F) -> Result<NonNull<T>>
    where
        Self: Sized,
        F: FnMut(usize) -> T,
    {
        let first = self.allocate::<T>(count)?;

        let mut guard = scopeguard::guard((self, 0_usize), |(pool, initialized)| {
            // SAFETY: Exactly the first `initialized` elements were written below.
            unsafe {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(first.as_ptr(), initialized));
            }

            _ = pool.deallocate(first, count);
        });

        for index in 0..count {
            let value = init(index);

            // SAFETY: index < count and the allocation holds count values of T.
            unsafe {
                first.add(index).write(value);
            }

            guard.1 = index.wrapping_add(1);
        }

        _ = ScopeGuard::into_inner(guard);

        Ok(first)
    }

    /// Drops `count` values in place and releases their memory.
    ///
    /// # Errors
    ///
    /// As [`deallocate()`][Self::deallocate]. The values are dropped even if the release fails.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `count` initialized values of `T` allocated from this pool, and the
    /// values must not be used afterwards.
    unsafe fn destruct<T>(&mut self, ptr: NonNull<T>, count: usize) -> Result<()>
    where
        Self: Sized,
    {
        // SAFETY: Forwarding the caller's guarantee that the values are initialized and unused.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), count));
        }

        self.deallocate(ptr, count)
    }
}

/// An [`Allocator`] that manages a known amount of memory.
pub trait MemPool: Allocator {
    /// Total bytes managed by the pool, allocated or not.
    fn size(&self) -> usize;

    /// Bytes currently allocated.
    fn used_count(&self) -> usize;

    /// Bytes currently free. The free bytes may be spread over several blocks.
    fn free_count(&self) -> usize {
        self.size()
            .checked_sub(self.used_count())
            .expect("a pool never has more bytes in use than it manages")
    }

    /// Whether a single free block can hold `size` bytes, so that an allocation of that size
    /// would succeed without growing.
    fn has_block_for(&self, size: usize) -> bool;
}

/// A [`MemPool`] that can add regions of backing memory and give idle ones back.
pub trait GrowablePool: MemPool {
    /// Makes sure a single free block of at least `size` bytes exists, adding a region if
    /// there is none.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the memory source cannot supply the region,
    /// [`Error::RecordsExhausted`] if no record is available to describe it.
    fn reserve(&mut self, size: usize) -> Result<()>;

    /// Adds a region of at least `size` bytes regardless of the current free space.
    ///
    /// # Errors
    ///
    /// As [`reserve()`][Self::reserve], plus [`Error::ZeroSize`] if `size` is zero.
    fn reserve_more(&mut self, size: usize) -> Result<()>;

    /// Returns every added region that is entirely free to the memory source and reports the
    /// number of bytes released.
    fn shrink(&mut self) -> usize;
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // The address equals the alignment, which is never zero.
    NonNull::new(ptr::without_provenance_mut(layout.align()))
        .expect("alignment is never zero")
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    use super::*;
    use crate::{HeapRecords, LinkedPool, StackBuffer, StackPool};

    struct DropCounter(Rc<Cell<usize>>);

    /// Forwards only the raw primitives, so the provided typed methods are used as they are.
    struct RawOnly<'a, 'buf>(&'a mut LinkedPool<'buf, HeapRecords>);

    impl Allocator for RawOnly<'_, '_> {
        fn allocate_raw(&mut self, count: usize, clear: bool) -> Result<NonNull<u8>> {
            self.0.allocate_raw(count, clear)
        }

        fn deallocate_raw(&mut self, ptr: NonNull<u8>, count: usize) -> Result<()> {
            self.0.deallocate_raw(ptr, count)
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn typed_allocation_is_aligned_after_odd_raw_allocation() {
        let mut buffer = StackBuffer::<256>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        // Knock the next free address off alignment.
        let odd = pool.allocate_raw(3, false).unwrap();

        let value = pool.allocate::<u64>(2).unwrap();
        assert_eq!(value.as_ptr().addr() % align_of::<u64>(), 0);

        // Only the requested bytes are allocated; the skipped ones stay free.
        assert_eq!(pool.used_count(), 3 + 16);

        pool.deallocate(value, 2).unwrap();
        pool.deallocate_raw(odd, 3).unwrap();
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn aligned_buffer_is_filled_to_the_last_byte() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        let values: Vec<_> = (0..8_u64)
            .map(|value| pool.construct(value).unwrap())
            .collect();

        assert_eq!(pool.used_count(), 64);
        assert_eq!(pool.free_count(), 0);
        assert!(values.iter().all(|value| value.as_ptr().addr() % align_of::<u64>() == 0));

        for value in values {
            unsafe { pool.destruct(value, 1) }.unwrap();
        }
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn typed_allocation_needs_no_more_records_than_raw() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = StackPool::<2>::with_buffer(&mut buffer).unwrap();

        let value = pool.construct(1_u32).unwrap();
        assert_eq!(pool.used_count(), 4);
        assert_eq!(pool.records().cached_len(), 2);

        unsafe { pool.destruct(value, 1) }.unwrap();
    }

    #[test]
    fn misaligned_fit_without_records_leaves_pool_unchanged() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = StackPool::<2>::with_buffer(&mut buffer).unwrap();

        // Both records are now in use and the free block starts off alignment.
        let odd = pool.allocate_raw(3, false).unwrap();
        let before: Vec<_> = pool.blocks().map(|block| (block.size(), block.is_free())).collect();

        assert_eq!(pool.allocate::<u64>(1), Err(Error::RecordsExhausted));

        let after: Vec<_> = pool.blocks().map(|block| (block.size(), block.is_free())).collect();
        assert_eq!(before, after);
        assert_eq!(pool.used_count(), 3);
        pool.assert_consistent();

        pool.deallocate_raw(odd, 3).unwrap();
    }

    #[test]
    fn aligned_start_is_found_past_a_block_too_small_after_padding() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        let a = pool.allocate_raw(1, false).unwrap();
        let b = pool.allocate_raw(9, false).unwrap();
        let c = pool.allocate_raw(6, false).unwrap();

        // Free bytes 1..10: nine of them, but only two past the next 8 byte boundary.
        pool.deallocate_raw(b, 9).unwrap();

        let value = pool.allocate::<u64>(1).unwrap();
        assert_eq!(value.as_ptr().addr() - a.as_ptr().addr(), 16);
        assert_eq!(pool.used_count(), 1 + 6 + 8);
        pool.assert_consistent();

        pool.deallocate(value, 1).unwrap();
        pool.deallocate_raw(c, 6).unwrap();
        pool.deallocate_raw(a, 1).unwrap();
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn out_of_capacity_reports_requested_bytes() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        assert_eq!(
            pool.allocate::<u64>(8),
            Err(Error::OutOfCapacity { requested: 64 })
        );

        let _odd = pool.allocate_raw(1, false).unwrap();
        assert_eq!(
            pool.allocate::<u64>(4),
            Err(Error::OutOfCapacity { requested: 32 })
        );
    }

    #[test]
    fn provided_alignment_keeps_an_aligned_exact_span() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        let values = RawOnly(&mut pool).allocate::<u64>(8).unwrap();
        assert_eq!(values.as_ptr().addr() % align_of::<u64>(), 0);
        assert_eq!(pool.used_count(), 64);

        RawOnly(&mut pool).deallocate(values, 8).unwrap();
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn provided_alignment_trims_padding() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();
        let odd = pool.allocate_raw(3, false).unwrap();

        // 60 bytes fit in the 61 free ones, but not once padded for alignment.
        assert_eq!(
            RawOnly(&mut pool).allocate::<u32>(15),
            Err(Error::OutOfCapacity { requested: 60 })
        );
        assert_eq!(pool.used_count(), 3);

        let value = RawOnly(&mut pool).allocate::<u64>(2).unwrap();
        assert_eq!(value.as_ptr().addr() % align_of::<u64>(), 0);
        assert_eq!(pool.used_count(), 3 + 16);
        pool.assert_consistent();

        RawOnly(&mut pool).deallocate(value, 2).unwrap();
        pool.deallocate_raw(odd, 3).unwrap();
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn allocate_zeroed_clears_memory() {
        let mut buffer = StackBuffer::<64>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        // Dirty the memory first.
        let dirty = pool.allocate_raw(64, false).unwrap();
        unsafe { dirty.write_bytes(0xAB, 64) };
        pool.deallocate_raw(dirty, 64).unwrap();

        let zeroed = pool.allocate_zeroed::<u32>(8).unwrap();
        let values = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 8) };
        assert!(values.iter().all(|value| *value == 0));
    }

    #[test]
    fn construct_and_destruct_drop_exactly_once() {
        let drops = Rc::new(Cell::new(0));
        let mut buffer = StackBuffer::<128>::new();
        let mut pool = LinkedPool::<HeapRecords>::new();
        pool.seed(&mut buffer).unwrap();

        let one = pool.construct(DropCounter(Rc::clone(&drops))).unwrap();
        let many = pool
            .construct_multiple(3, |_| DropCounter(Rc::clone(&drops)))
            .unwrap();
        assert_eq!(drops.get(), 0);

        unsafe { pool.destruct(many, 3) }.unwrap();
        assert_eq!(drops.get(), 3);

        unsafe { pool.destruct(one, 1) }.unwrap();
        assert_eq!(drops.get(), 4);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn construct_multiple_cleans_up_after_panic() {
        let drops = Rc::new(Cell::new(0));
        let mut buffer = StackBuffer::<256>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.construct_multiple(5, |index| {
                assert!(index < 3, "initializer gives up");
                DropCounter(Rc::clone(&drops))
            })
        }));

        assert!(result.is_err());
        assert_eq!(drops.get(), 3);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn zero_sized_types_do_not_touch_the_pool() {
        let mut pool = LinkedPool::<HeapRecords>::new();

        let unit = pool.construct(()).unwrap();
        assert_eq!(pool.used_count(), 0);

        unsafe { pool.destruct(unit, 1) }.unwrap();
    }

    #[test]
    fn overflowing_count_is_reported() {
        let mut pool = LinkedPool::<HeapRecords>::new();

        assert_eq!(
            pool.allocate::<u64>(usize::MAX).unwrap_err(),
            Error::SizeOverflow
        );
    }

    #[test]
    fn failed_typed_allocation_leaves_pool_unchanged() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();

        assert!(matches!(
            pool.allocate::<u64>(8),
            Err(Error::OutOfCapacity { .. })
        ));
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn raw_primitives_are_object_safe() {
        let mut buffer = StackBuffer::<32>::new();
        let mut pool = LinkedPool::<HeapRecords>::with_buffer(&mut buffer).unwrap();
        let allocator: &mut dyn Allocator = &mut pool;

        let ptr = allocator.allocate_raw(8, true).unwrap();
        allocator.deallocate_raw(ptr, 8).unwrap();
    }
}
