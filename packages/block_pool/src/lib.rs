#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Block-splitting free-list memory pools with partial deallocation.
//!
//! A pool manages one or more regions of memory as a list of blocks. Allocating splits the first
//! free block that is large enough, deallocating accepts any sub-range of a live allocation and
//! isolates exactly that range, and free neighbours are joined again so that fragmentation does
//! not accumulate.
//!
//! The block records live apart from the managed memory in a [`RecordStore`]. The store decides
//! whether the pool touches the heap for bookkeeping at all: [`CachedRecords`] keeps a fixed
//! number of records inside the pool object and falls back to [`HeapRecords`] (or to nothing,
//! with [`NoRecords`]) only when those run out.
//!
//! # Pool flavors
//!
//! | Type | Memory | Records |
//! |------|--------|---------|
//! | [`LinkedPool`] | seeded by the owner | [`HeapRecords`] |
//! | [`FastLinkedPool<N>`] | seeded by the owner | `N` in-object, then heap |
//! | [`StackPool<N>`] | a borrowed [`StackBuffer`] | `N` in-object only |
//! | [`DynamicPool`] | seeded, then a [`MemorySource`] | [`HeapRecords`] |
//! | [`HeapPool<N>`] | the global allocator | `N` in-object, then heap |
//! | [`BufHeapPool<N>`] | a borrowed buffer, then the global allocator | `N` in-object, then heap |
//!
//! # Operations
//!
//! Every pool implements [`Allocator`], which offers raw byte ranges plus typed helpers that
//! take care of size overflow and alignment, and [`MemPool`] for introspection. Dynamic pools
//! also implement [`GrowablePool`].
//!
//! ```
//! use block_pool::{Allocator, GrowablePool, HeapPool, MemPool};
//!
//! let mut pool = HeapPool::<8>::builder().initial_capacity(256).build().unwrap();
//!
//! let values = pool.construct_multiple(4, |index| index as u64 * 10).unwrap();
//! assert_eq!(pool.used_count(), 32);
//!
//! // SAFETY: The four values were constructed above and are not used afterwards.
//! unsafe { pool.destruct(values, 4).unwrap() };
//! assert_eq!(pool.used_count(), 0);
//! ```
//!
//! # Errors
//!
//! Every failure is reported as an [`Error`] and leaves the pool as it was. This includes
//! releasing memory the pool does not own, releasing memory twice and running out of
//! bookkeeping records.
//!
//! # Thread safety
//!
//! Pools are thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). Wrap a pool in a lock to
//! share it between threads.

mod allocator;
mod block;
mod builder;
mod cached_records;
mod dynamic_pool;
mod error;
mod linked_pool;
mod memory_source;
mod policy;
mod records;
mod stack_buffer;

pub use allocator::*;
pub use block::*;
pub use builder::*;
pub use cached_records::*;
pub use dynamic_pool::*;
pub use error::*;
pub use linked_pool::{FastLinkedPool, LinkedPool, StackPool};
pub use memory_source::*;
pub use policy::*;
pub use records::*;
pub use stack_buffer::*;
