//! Memory blocks backing small allocations.
//!
//! A [`Block`] is one contiguous region obtained from the underlying
//! allocator and subdivided by a bump cursor. The pool keeps its blocks in
//! chain order; the header lives outside the block so the whole region is
//! usable data.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::allocator::{self, Allocator};
use crate::error::Result;

/// Alignment applied to aligned small allocations (platform pointer width).
pub const ALIGNMENT: usize = size_of::<usize>();

/// Alignment of every block obtained from the underlying allocator.
pub const POOL_ALIGNMENT: usize = 16;

/// Rounds `offset` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// One block of the pool's chain.
#[derive(Debug)]
pub struct Block {
    /// Start of the block's memory region.
    memory: NonNull<u8>,
    /// Offset of the next free byte.
    last: usize,
    /// Offset one past the usable region.
    end: usize,
    /// Consecutive growth events that found this block too small.
    pub(crate) failed: u32,
}

impl Block {
    /// Allocates a fresh block of `size` bytes.
    pub(crate) fn allocate(allocator: &dyn Allocator, size: usize) -> Result<Self> {
        let layout = allocator::layout(size, POOL_ALIGNMENT)?;
        let memory = allocator.allocate(layout)?;

        Ok(Self {
            memory,
            last: 0,
            end: size,
            failed: 0,
        })
    }

    /// Carves `size` bytes from the free tail of the block.
    ///
    /// With `align`, the start is rounded up to [`ALIGNMENT`]. Block memory
    /// is [`POOL_ALIGNMENT`]-aligned, so aligning the offset aligns the address.
    #[inline]
    pub(crate) fn try_carve(&mut self, size: usize, align: bool) -> Option<NonNull<u8>> {
        let m = if align {
            align_up(self.last, ALIGNMENT)
        } else {
            self.last
        };

        if m > self.end || self.end - m < size {
            return None;
        }

        self.last = m + size;
        // SAFETY: m <= end, so the pointer stays within (or one past) the block
        Some(unsafe { self.memory.add(m) })
    }

    /// Rewinds the cursor and forgets past failures. Data is not zeroed.
    pub(crate) const fn rewind(&mut self) {
        self.last = 0;
        self.failed = 0;
    }

    /// Returns `true` if `ptr` falls inside this block's region.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let start = self.memory.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.end
    }

    /// Total size of the block in bytes.
    pub(crate) const fn capacity(&self) -> usize {
        self.end
    }

    /// Bytes carved so far, alignment padding included.
    pub(crate) const fn used(&self) -> usize {
        self.last
    }

    /// Bytes still available at the tail.
    pub(crate) const fn unused(&self) -> usize {
        self.end - self.last
    }

    /// Start address, for diagnostics.
    pub(crate) const fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Returns the block's memory to `allocator`.
    ///
    /// # Safety
    ///
    /// `allocator` must be the allocator the block was obtained from, and no
    /// pointer into the block may be used afterwards.
    pub(crate) unsafe fn release(self, allocator: &dyn Allocator) {
        // SAFETY: the same size and alignment were validated in allocate()
        let layout = unsafe { Layout::from_size_align_unchecked(self.end, POOL_ALIGNMENT) };
        // SAFETY: memory was allocated with this layout by this allocator
        unsafe { allocator.deallocate(self.memory, layout) };
    }
}
