use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};

/// A fixed-size byte buffer meant to live on the stack (or inside another object) and be lent to
/// a pool as its first region.
///
/// The pool borrows the buffer for its whole lifetime, so the buffer cannot move while pointers
/// into it are handed out. The buffer is aligned to [`REGION_ALIGN`][crate::REGION_ALIGN].
///
/// # Examples
///
/// ```
/// use block_pool::{Allocator, MemPool, StackBuffer, StackPool};
///
/// let mut buffer = StackBuffer::<256>::new();
/// let mut pool = StackPool::<8>::with_buffer(&mut buffer).unwrap();
///
/// let value = pool.construct(7_u32).unwrap();
/// assert_eq!(pool.used_count(), 4);
/// # // SAFETY: The value was constructed above and is not used afterwards.
/// # unsafe { pool.destruct(value, 1).unwrap() };
/// ```
#[derive(Debug)]
#[repr(C, align(16))]
pub struct StackBuffer<const N: usize> {
    bytes: [MaybeUninit<u8>; N],
}

impl<const N: usize> StackBuffer<N> {
    /// Creates an uninitialized buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [MaybeUninit::uninit(); N],
        }
    }

    /// The size of the buffer in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    /// Whether the buffer has no bytes at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for StackBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for StackBuffer<N> {
    type Target = [MaybeUninit<u8>];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl<const N: usize> DerefMut for StackBuffer<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REGION_ALIGN;

    #[test]
    fn is_region_aligned() {
        assert_eq!(align_of::<StackBuffer<3>>(), REGION_ALIGN);

        let buffer = StackBuffer::<5>::new();
        assert_eq!(buffer.as_ptr().addr() % REGION_ALIGN, 0);
    }

    #[test]
    fn derefs_to_full_length_slice() {
        let mut buffer = StackBuffer::<33>::new();

        assert_eq!(buffer.len(), 33);
        assert_eq!(buffer.deref_mut().len(), 33);
        assert!(!buffer.is_empty());
        assert!(StackBuffer::<0>::new().is_empty());
    }
}
