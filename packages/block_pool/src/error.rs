use thiserror::Error;

/// Errors reported by pool operations.
///
/// Every operation that returns one of these leaves the pool exactly as it was before the call.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// No free block is large enough to satisfy the request.
    ///
    /// The pool may still have that many free bytes in total, split across several blocks.
    #[error("no free block can hold {requested} bytes")]
    OutOfCapacity {
        /// The number of bytes that was requested.
        requested: usize,
    },

    /// A block had to be split but no bookkeeping record could be obtained to describe the
    /// second half of the split.
    #[error("no bookkeeping record is available to describe a new block")]
    RecordsExhausted,

    /// The address does not fall inside any block owned by the pool.
    #[error("address {address:#x} is not owned by this pool")]
    InvalidFree {
        /// The address that was passed in.
        address: usize,
    },

    /// The address falls inside a block that is already free.
    #[error("address {address:#x} is already free")]
    DoubleFree {
        /// The address that was passed in.
        address: usize,
    },

    /// The released range runs past the end of the allocated block containing its start.
    #[error(
        "releasing {requested} bytes at {address:#x} overruns the {available} allocated bytes left in its block"
    )]
    OverRelease {
        /// The address that was passed in.
        address: usize,

        /// The number of bytes the caller attempted to release.
        requested: usize,

        /// The number of bytes from `address` to the end of the containing block.
        available: usize,
    },

    /// The memory source could not supply a new region.
    #[error("memory source could not supply a region of {requested} bytes")]
    OutOfMemory {
        /// The region size that was requested from the memory source.
        requested: usize,
    },

    /// Raw requests and regions must be at least one byte long.
    #[error("zero-sized raw requests and regions are not supported")]
    ZeroSize,

    /// The byte size of a typed request does not fit in `usize`.
    #[error("the byte size of the request overflows usize")]
    SizeOverflow,
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
