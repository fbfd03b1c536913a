//! A chunked memory pool for large numbers of fixed-size elements.
//!
//! This crate provides [`ChunkPool`], a memory manager that hands out untyped elements of one
//! fixed size with O(1) allocation and release. Memory is obtained from a backend in chunks,
//! each holding a fixed number of elements, so the cost of talking to the backend is amortized
//! across many elements.
//!
//! # Key Features
//!
//! - **O(1) allocation and release**: a free list is threaded through the unused elements
//!   themselves, so no bookkeeping memory is needed beyond the chunks.
//! - **Stable addresses**: elements never move while they are allocated.
//! - **Optional iteration**: with [`PoolFlags::ALLOW_ITERATION`], free elements are tagged so the
//!   pool can enumerate, index and export its live elements.
//! - **Bounded idle memory**: when the last element is released, every chunk except the first
//!   is returned to the backend.
//! - **Pluggable backend**: chunks come from the Rust global allocator, the system allocator
//!   ([`PoolFlags::USE_SYSTEM_ALLOCATOR`]) or any custom [`ChunkAllocator`].
//!
//! # Element pointers
//!
//! Elements are handed out as `NonNull<u8>` and the pool never creates references to their
//! memory, so callers decide how to alias and access it. A pointer remains valid until it is
//! passed to [`ChunkPool::free()`], the pool is [cleared][ChunkPool::clear] or the pool is
//! dropped.
//!
//! # Examples
//!
//! ```rust
//! use chunk_pool::ChunkPool;
//!
//! let mut pool = ChunkPool::builder()
//!     .element_size_of::<[u64; 4]>()
//!     .allow_iteration()
//!     .build();
//!
//! let a = pool.allocate_zeroed();
//! let b = pool.allocate();
//!
//! // SAFETY: Both pointers refer to live elements of at least 32 bytes.
//! unsafe {
//!     a.cast::<[u64; 4]>().write_unaligned([1, 2, 3, 4]);
//!     b.cast::<[u64; 4]>().write_unaligned([5, 6, 7, 8]);
//! }
//!
//! assert_eq!(pool.len(), 2);
//! assert_eq!(pool.iter().collect::<Vec<_>>(), vec![a, b]);
//!
//! // SAFETY: Both pointers came from this pool and are released exactly once.
//! unsafe {
//!     pool.free(a);
//!     pool.free(b);
//! }
//!
//! assert!(pool.is_empty());
//! ```

mod backend;
mod builder;
mod chunk;
mod drop_policy;
mod error;
mod flags;
mod iter;
mod pool;
mod slot;

pub use backend::*;
pub use builder::*;
pub(crate) use chunk::*;
pub use drop_policy::*;
pub use error::Error;
pub(crate) use error::Result;
pub use flags::*;
pub use iter::Iter;
pub use pool::{ChunkPool, DEFAULT_ELEMENTS_PER_CHUNK, MIN_ELEMENT_SIZE};
pub(crate) use slot::*;
