//! Underlying allocator trait and default implementation.
//!
//! This module provides the [`Allocator`] trait that supplies the raw memory a
//! [`Pool`](crate::Pool) carves up: whole blocks, large payloads and
//! over-aligned payloads. [`DefaultAllocator`] forwards to the standard
//! library's global allocator.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Alignment of "unaligned" requests, matching what `malloc` guarantees.
pub const MALLOC_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Trait for memory allocation backends.
///
/// The pool asks for two kinds of memory: aligned requests (blocks, and
/// payloads with a caller-chosen alignment) carry the alignment in the
/// layout, default requests (large payloads) use [`MALLOC_ALIGNMENT`].
///
/// # Safety
///
/// Implementations must ensure:
/// - `allocate` returns a pointer valid for `layout.size()` bytes and aligned
///   to `layout.align()`
/// - the memory stays valid until `deallocate` is called with the same layout
///
/// # Example
///
/// ```rust
/// use std::alloc::Layout;
/// use std::ptr::NonNull;
/// use ruapc_regionpool::{Allocator, Result};
///
/// struct MyAllocator;
///
/// impl Allocator for MyAllocator {
///     fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
///         // Custom allocation logic
///         # unimplemented!()
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
///         // Custom deallocation logic
///         # unimplemented!()
///     }
/// }
/// ```
pub trait Allocator: Send + Sync {
    /// Allocates memory described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the memory cannot be provided and
    /// [`Error::InvalidSize`] for zero-sized layouts.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Deallocates memory previously allocated by this allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `ptr` was returned by a previous call to `allocate` on this allocator
    /// - `layout` is the layout passed to that call
    /// - the memory has not already been deallocated
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Default allocator using the standard library's global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    /// Creates a new default allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::InvalidSize(0));
        }

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr).ok_or(Error::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: ptr was allocated with this layout by allocate()
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

/// Builds a layout, telling a bad alignment apart from an overflowing size.
pub(crate) fn layout(size: usize, alignment: usize) -> Result<Layout> {
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidAlignment(alignment));
    }
    Layout::from_size_align(size, alignment).map_err(|_| Error::InvalidSize(size))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocator_basic() {
        let allocator = DefaultAllocator::new();

        let layout = Layout::from_size_align(4096, 16).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        // Write and read back
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, layout.size());
            assert_eq!(*ptr.as_ptr(), 0xAB);
            assert_eq!(*ptr.as_ptr().add(layout.size() - 1), 0xAB);
        }

        unsafe {
            allocator.deallocate(ptr, layout);
        }
    }

    #[test]
    fn test_default_allocator_zero_size() {
        let allocator = DefaultAllocator::new();
        let result = allocator.allocate(Layout::from_size_align(0, 8).unwrap());
        assert_eq!(result, Err(Error::InvalidSize(0)));
    }

    #[test]
    fn test_default_allocator_page_alignment() {
        let allocator = DefaultAllocator::new();

        let layout = Layout::from_size_align(100, 4096).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);

        unsafe {
            allocator.deallocate(ptr, layout);
        }
    }

    #[test]
    fn test_layout_errors() {
        assert_eq!(layout(64, 3), Err(Error::InvalidAlignment(3)));
        assert_eq!(layout(64, 0), Err(Error::InvalidAlignment(0)));
        assert_eq!(layout(usize::MAX, 8), Err(Error::InvalidSize(usize::MAX)));
        assert!(layout(64, MALLOC_ALIGNMENT).is_ok());
    }
}
