//! Error type shared by the pool and its underlying allocator.

/// Errors reported by [`Pool`](crate::Pool) operations and [`Allocator`](crate::Allocator)
/// implementations.
///
/// A pointer that is not tracked by the pool is not an error: [`Pool::free`](crate::Pool::free)
/// reports it by returning `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The underlying allocator could not satisfy a request of `size` bytes.
    #[error("out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Number of bytes requested.
        size: usize,
    },

    /// The requested size is zero, overflows a layout, or is below the pool minimum.
    #[error("invalid size: {0}")]
    InvalidSize(usize),

    /// The requested alignment is not a power of two.
    #[error("invalid alignment: {0} (must be a power of two)")]
    InvalidAlignment(usize),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
