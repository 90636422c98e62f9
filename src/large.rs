//! Large allocations tracked for individual release.
//!
//! Requests above the pool threshold are served straight from the underlying
//! allocator. Their bookkeeping nodes are carved from pool memory and linked
//! most-recent-first; a freed payload leaves its node behind as a reusable
//! slot.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::allocator::{self, MALLOC_ALIGNMENT};
use crate::error::Result;
use crate::intrusive_list::IntrusiveNode;
use crate::pool::Pool;

/// Payload slot of a large-list node.
#[derive(Debug)]
pub struct LargeSlot {
    /// The attached payload; `None` once freed.
    pub(crate) alloc: Option<NonNull<u8>>,
    /// Layout the payload was allocated with.
    pub(crate) layout: Layout,
}

/// A large-list node as stored in pool memory.
pub type LargeNode = IntrusiveNode<LargeSlot>;

impl Pool {
    /// Allocates `size` bytes straight from the underlying allocator.
    ///
    /// The first `large_scan_depth` nodes are probed for a vacated slot before
    /// a new node is carved. Vacated slots deeper in the list stay unused
    /// until reset or destruction.
    pub(crate) fn alloc_large(&mut self, size: usize) -> Result<NonNull<u8>> {
        let layout = allocator::layout(size, MALLOC_ALIGNMENT)?;
        let payload = self.allocator.allocate(layout)?;

        for node in self.large.iter().take(self.large_scan_depth) {
            // SAFETY: linked nodes live in pool blocks
            let slot = unsafe { &mut (*node.as_ptr()).data };
            if slot.alloc.is_none() {
                slot.alloc = Some(payload);
                slot.layout = layout;
                return Ok(payload);
            }
        }

        self.track_large(payload, layout)
    }

    /// Allocates `size` bytes aligned to `alignment` and tracks them as a
    /// large allocation, whatever the size.
    ///
    /// Vacated slots are not reused: a new node is always carved.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes.
    /// * `alignment` - Required alignment, a power of two.
    ///
    /// # Returns
    ///
    /// A tracked large payload that [`free`](Self::free) can release early.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAlignment`](crate::Error::InvalidAlignment) if
    ///   `alignment` is not a power of two
    /// - the underlying allocator's error, including for `size == 0` with
    ///   [`DefaultAllocator`](crate::DefaultAllocator)
    pub fn pmemalign(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let layout = allocator::layout(size, alignment)?;
        let payload = self.allocator.allocate(layout)?;
        self.track_large(payload, layout)
    }

    /// Releases a large allocation before the pool goes away.
    ///
    /// # Arguments
    ///
    /// * `ptr` - A pointer returned by a large allocation of this pool.
    ///
    /// # Returns
    ///
    /// `true` if the payload was released. `false` when `ptr` is not an
    /// attached large payload of this pool, e.g. a small allocation or a
    /// pointer already freed.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        for node in self.large.iter() {
            // SAFETY: linked nodes live in pool blocks
            let slot = unsafe { &mut (*node.as_ptr()).data };
            if slot.alloc == Some(ptr) {
                tracing::debug!(parent: &self.log, ptr = ?ptr, "free large allocation");
                // SAFETY: the payload was allocated with slot.layout and is detached below
                unsafe { self.allocator.deallocate(ptr, slot.layout) };
                slot.alloc = None;
                return true;
            }
        }

        false
    }

    /// Returns `true` if `ptr` is an attached large payload of this pool.
    #[must_use]
    pub fn is_large(&self, ptr: NonNull<u8>) -> bool {
        self.large.iter().any(|node| {
            // SAFETY: linked nodes live in pool blocks
            unsafe { (*node.as_ptr()).data.alloc == Some(ptr) }
        })
    }

    pub(crate) fn large_allocations(&self) -> usize {
        self.large
            .iter()
            // SAFETY: linked nodes live in pool blocks
            .filter(|node| unsafe { (*node.as_ptr()).data.alloc.is_some() })
            .count()
    }

    /// Releases every attached payload. Nodes stay linked as vacated slots.
    pub(crate) fn release_large(&mut self) {
        for node in self.large.iter() {
            // SAFETY: linked nodes live in pool blocks
            let slot = unsafe { &mut (*node.as_ptr()).data };
            if let Some(payload) = slot.alloc.take() {
                tracing::trace!(parent: &self.log, ptr = ?payload, "free large allocation");
                // SAFETY: the payload was allocated with slot.layout
                unsafe { self.allocator.deallocate(payload, slot.layout) };
            }
        }
    }

    /// Carves a node for `payload` and links it at the head of the list.
    ///
    /// The payload is released again if no node can be carved.
    fn track_large(&mut self, payload: NonNull<u8>, layout: Layout) -> Result<NonNull<u8>> {
        let node = match self.alloc_small(size_of::<LargeNode>(), true) {
            Ok(node) => node.cast::<LargeNode>(),
            Err(err) => {
                // SAFETY: the payload was just allocated with layout and never handed out
                unsafe { self.allocator.deallocate(payload, layout) };
                return Err(err);
            }
        };

        // SAFETY: node is freshly carved, aligned to ALIGNMENT and sized for a LargeNode
        unsafe {
            node.write(IntrusiveNode::new(LargeSlot {
                alloc: Some(payload),
                layout,
            }));
            self.large.push_front(node);
        }

        Ok(payload)
    }
}
