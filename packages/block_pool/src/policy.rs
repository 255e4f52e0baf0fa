/// Determines what happens when a pool is dropped while allocations are still outstanding.
///
/// By default, the pool releases its memory regardless.
///
/// # Examples
///
/// ```
/// use block_pool::{DropPolicy, HeapPool};
///
/// let pool = HeapPool::<4>::builder()
///     .drop_policy(DropPolicy::MustNotDropAllocations)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool may be dropped with live allocations. Any pointers into the pool dangle
    /// afterwards. This is the default.
    #[default]
    MayDropAllocations,

    /// The pool will panic if it still has live allocations when it is dropped.
    ///
    /// This may be valuable if callers hand out pointers into pool memory and need a loud
    /// signal when the pool is torn down before every pointer has been returned.
    MustNotDropAllocations,
}

/// Determines when adjacent free blocks are joined into one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum CoalescePolicy {
    /// A freed block is joined with free neighbours in the same region as part of the
    /// deallocation. This is the default.
    #[default]
    OnFree,

    /// Freed blocks stay distinct until the owner calls
    /// [`join_free_blocks()`][crate::LinkedPool::join_free_blocks].
    Manual,
}

/// Determines whether a growable pool fetches more memory by itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum GrowthPolicy {
    /// The pool only grows through explicit [`reserve()`][crate::GrowablePool::reserve] and
    /// [`reserve_more()`][crate::GrowablePool::reserve_more] calls. An allocation that does
    /// not fit fails. This is the default.
    #[default]
    Manual,

    /// An allocation that does not fit adds a region large enough for it and retries once.
    OnDemand,
}
