//! # ruapc-regionpool
//!
//! A region (arena) memory pool for request-scoped allocation. This crate is
//! part of the [ruapc](https://github.com/SF-Zhou/ruapc) project.
//!
//! A [`Pool`] is created for one unit of work, such as a connection or a
//! request. Everything allocated from it is released together when the pool
//! is dropped, so handlers never free memory one object at a time.
//!
//! ## Features
//!
//! - **Bump Allocation**: Small requests are carved from a chain of
//!   fixed-size blocks in O(1)
//! - **Large Allocations**: Requests above the pool threshold go to the
//!   underlying allocator and can be freed early with [`Pool::free`]
//! - **Cleanup Handlers**: External resources such as open files are tied to
//!   the pool's lifetime and released, most recent first, on destruction
//! - **Reset**: A pool can be rewound and reused without returning its
//!   blocks to the allocator
//! - **Custom Allocators**: Pluggable [`Allocator`] trait for the memory
//!   backend
//! - **Tracing**: Diagnostics are reported under a caller-supplied
//!   [`tracing::Span`]
//!
//! ## Example
//!
//! ```rust
//! use ruapc_regionpool::{Pool, PoolBuilder};
//!
//! # fn main() -> ruapc_regionpool::Result<()> {
//! // One pool per request, with 4KiB blocks
//! let mut pool = PoolBuilder::new()
//!     .size(4096)
//!     .log(tracing::info_span!("request", id = 1))
//!     .build()?;
//!
//! // Small requests share the pool's blocks
//! let header = pool.alloc(100)?;
//! let name = pool.copy_bytes(b"content-length")?;
//!
//! // Large requests are tracked individually
//! let body = pool.alloc(64 * 1024)?;
//! assert!(pool.is_large(body));
//! assert!(pool.free(body));
//!
//! // Everything else goes away at once
//! # let _ = (header, name);
//! pool.destroy();
//! # Ok(())
//! # }
//! ```
//!
//! ## Cleanup Example
//!
//! ```rust
//! use std::ptr::NonNull;
//! use ruapc_regionpool::{CleanupHandler, Pool};
//!
//! unsafe fn release(data: Option<NonNull<u8>>) {
//!     let counter = unsafe { data.unwrap().cast::<u64>().read() };
//!     println!("releasing resource {counter}");
//! }
//!
//! # fn main() -> ruapc_regionpool::Result<()> {
//! let mut pool = Pool::create(1024, tracing::Span::none())?;
//!
//! let mut cleanup = pool.cleanup_add(size_of::<u64>())?;
//! unsafe {
//!     cleanup.data().unwrap().cast::<u64>().write(42);
//!     cleanup.set_handler(CleanupHandler::Custom(release));
//! }
//!
//! // Runs `release` before the blocks are returned
//! drop(pool);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod block;
mod cleanup;
mod error;
#[cfg(unix)]
mod file;
mod intrusive_list;
mod large;
mod pool;

pub use allocator::{Allocator, DefaultAllocator, MALLOC_ALIGNMENT};
pub use block::{ALIGNMENT, POOL_ALIGNMENT};
pub use cleanup::{Cleanup, CleanupFn, CleanupHandler};
pub use error::{Error, Result};
#[cfg(unix)]
pub use file::FileCleanup;
pub use pool::{
    DEFAULT_POOL_SIZE, LARGE_SCAN_DEPTH, MAX_ALLOC_FROM_POOL, MAX_FAILED, MIN_POOL_SIZE, Pool,
    PoolBuilder, PoolStats,
};
