use std::alloc::{Layout, alloc, dealloc};
use std::fmt::Debug;
use std::ptr::NonNull;

/// Alignment of every region obtained from [`GlobalMemory`] and of
/// [`StackBuffer`][crate::StackBuffer].
pub const REGION_ALIGN: usize = 16;

/// Supplies backing memory to a growable pool and takes it back.
///
/// A [`DynamicPool`][crate::DynamicPool] owns its source and calls it whenever it adds a region
/// ([`reserve()`][crate::GrowablePool::reserve] and friends) or gives one up
/// ([`shrink()`][crate::GrowablePool::shrink] and drop).
pub trait MemorySource: Debug {
    /// Obtains a region of exactly `size` bytes, or `None` if the source is out of memory.
    ///
    /// `size` is never zero.
    fn allocate_memory(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a region to the source.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a region previously returned by
    /// [`allocate_memory()`][Self::allocate_memory] on this source and not yet returned.
    unsafe fn deallocate_memory(&mut self, ptr: NonNull<u8>, size: usize);
}

/// Obtains regions from the Rust global allocator, aligned to [`REGION_ALIGN`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalMemory;

impl GlobalMemory {
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, REGION_ALIGN).ok()
    }
}

impl MemorySource for GlobalMemory {
    fn allocate_memory(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let layout = Self::layout(size)?;

        // SAFETY: The layout is valid and not zero-sized (guarded above).
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn deallocate_memory(&mut self, ptr: NonNull<u8>, size: usize) {
        let layout = Self::layout(size)
            .expect("the layout was valid when the region was allocated, so it still is");

        // SAFETY: Forwarding the caller's guarantee that the region came from allocate_memory(),
        // which used this same layout.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(GlobalMemory: Send, Sync, Debug, Default, Copy);

    #[test]
    fn regions_are_aligned() {
        let mut source = GlobalMemory;

        let region = source.allocate_memory(3).unwrap();
        assert_eq!(region.as_ptr().addr() % REGION_ALIGN, 0);

        // SAFETY: Returning the region we just obtained.
        unsafe {
            source.deallocate_memory(region, 3);
        }
    }

    #[test]
    fn zero_size_is_refused() {
        assert!(GlobalMemory.allocate_memory(0).is_none());
    }

    #[test]
    fn absurd_size_is_refused() {
        assert!(GlobalMemory.allocate_memory(usize::MAX).is_none());
    }
}
