//! Region pool: block chain, small allocator and pool lifecycle.
//!
//! This module provides the [`Pool`] and [`PoolBuilder`] types. Small
//! requests are carved from a chain of equally sized blocks; requests above
//! the pool threshold go to the large allocator (see `large.rs`), and
//! deferred cleanups live in the cleanup chain (see `cleanup.rs`).

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

use tracing::Span;

use crate::allocator::{Allocator, DefaultAllocator};
use crate::block::{ALIGNMENT, Block, POOL_ALIGNMENT, align_up};
use crate::cleanup::{CleanupEntry, CleanupNode};
use crate::error::{Error, Result};
use crate::intrusive_list::IntrusiveList;
use crate::large::{LargeNode, LargeSlot};

/// Default size of every block in a pool (16 KiB).
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Default ceiling on the small/large threshold.
pub const MAX_ALLOC_FROM_POOL: usize = 4096 - 1;

/// Default number of large-list nodes probed for a vacated slot.
pub const LARGE_SCAN_DEPTH: usize = 4;

/// Default failure count after which a block stops being probed.
pub const MAX_FAILED: u32 = 4;

/// Smallest accepted pool size: room for two metadata nodes.
pub const MIN_POOL_SIZE: usize = align_up(
    2 * if size_of::<LargeNode>() > size_of::<CleanupNode>() {
        size_of::<LargeNode>()
    } else {
        size_of::<CleanupNode>()
    },
    POOL_ALIGNMENT,
);

const _: () = assert!(align_of::<LargeNode>() <= ALIGNMENT);
const _: () = assert!(align_of::<CleanupNode>() <= ALIGNMENT);

/// Builder for creating a [`Pool`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use ruapc_regionpool::PoolBuilder;
///
/// # fn main() -> ruapc_regionpool::Result<()> {
/// let pool = PoolBuilder::new()
///     .size(4096)
///     .log(tracing::info_span!("request", id = 7))
///     .build()?;
/// assert_eq!(pool.max(), 4095);
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder {
    size: usize,
    max_alloc_from_pool: usize,
    large_scan_depth: usize,
    max_failed: u32,
    allocator: Box<dyn Allocator>,
    log: Span,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - Block size: 16 KiB
    /// - Threshold ceiling: 4095 bytes
    /// - Large-list scan depth: 4, block retirement after more than 4 failures
    /// - Allocator: [`DefaultAllocator`]
    /// - Diagnostic span: [`Span::none`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            max_alloc_from_pool: MAX_ALLOC_FROM_POOL,
            large_scan_depth: LARGE_SCAN_DEPTH,
            max_failed: MAX_FAILED,
            allocator: Box::new(DefaultAllocator::new()),
            log: Span::none(),
        }
    }

    /// Sets the size of every block, the first one included.
    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the ceiling on the small/large threshold.
    ///
    /// The effective threshold is `min(size, ceiling)`.
    #[must_use]
    pub const fn max_alloc_from_pool(mut self, ceiling: usize) -> Self {
        self.max_alloc_from_pool = ceiling;
        self
    }

    /// Sets how many large-list nodes are probed for a vacated slot.
    #[must_use]
    pub const fn large_scan_depth(mut self, depth: usize) -> Self {
        self.large_scan_depth = depth;
        self
    }

    /// Sets the failure count a block must exceed before it is skipped.
    #[must_use]
    pub const fn max_failed(mut self, max_failed: u32) -> Self {
        self.max_failed = max_failed;
        self
    }

    /// Sets a custom underlying allocator.
    #[must_use]
    pub fn allocator(mut self, allocator: Box<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Sets the span pool diagnostics are attached to.
    #[must_use]
    pub fn log(mut self, log: Span) -> Self {
        self.log = log;
        self
    }

    /// Builds the pool, allocating its first block.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if the size is below [`MIN_POOL_SIZE`]
    /// - any error of the underlying allocator
    pub fn build(self) -> Result<Pool> {
        if self.size < MIN_POOL_SIZE {
            return Err(Error::InvalidSize(self.size));
        }

        let root = Block::allocate(self.allocator.as_ref(), self.size)?;

        Ok(Pool {
            blocks: vec![root],
            max: self.size.min(self.max_alloc_from_pool),
            current: 0,
            large: IntrusiveList::new(),
            cleanup: IntrusiveList::new(),
            log: self.log,
            allocator: self.allocator,
            large_scan_depth: self.large_scan_depth,
            max_failed: self.max_failed,
        })
    }
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of blocks in the chain.
    pub blocks: usize,
    /// Combined size of all blocks.
    pub capacity: usize,
    /// Bytes carved from blocks, alignment padding included.
    pub used: usize,
    /// Large payloads currently attached.
    pub large_allocations: usize,
    /// Large-list nodes, vacated slots included.
    pub large_nodes: usize,
    /// Registered cleanup nodes, already-run ones included.
    pub cleanups: usize,
}

/// A region pool tied to one unit of work.
///
/// Small requests are bump-allocated from a chain of blocks and released
/// together; requests above [`max`](Self::max) are served individually and may
/// be freed early with [`free`](Self::free). Dropping the pool runs the
/// registered cleanups and releases everything.
///
/// Returned pointers stay valid until [`reset`](Self::reset) or destruction.
/// The pool may move between threads but must not be shared.
///
/// # Example
///
/// ```rust
/// use ruapc_regionpool::Pool;
///
/// # fn main() -> ruapc_regionpool::Result<()> {
/// let mut pool = Pool::create(4096, tracing::Span::none())?;
///
/// let small = pool.alloc(100)?;
/// let big = pool.alloc(5000)?;
/// assert!(!pool.is_large(small));
/// assert!(pool.is_large(big));
///
/// assert!(pool.free(big));
/// pool.destroy();
/// # Ok(())
/// # }
/// ```
pub struct Pool {
    /// The block chain; block 0 is the root block.
    pub(crate) blocks: Vec<Block>,
    /// Small/large threshold.
    pub(crate) max: usize,
    /// Index of the first block still worth probing.
    pub(crate) current: usize,
    /// Large allocations, most recent first.
    pub(crate) large: IntrusiveList<LargeSlot>,
    /// Cleanup chain, most recent first.
    pub(crate) cleanup: IntrusiveList<CleanupEntry>,
    /// Diagnostic sink.
    pub(crate) log: Span,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) large_scan_depth: usize,
    pub(crate) max_failed: u32,
}

// SAFETY: the pool exclusively owns every block, payload and node it points
// to, and the allocator is Send + Sync. It is not Sync: all access needs &mut.
unsafe impl Send for Pool {}

impl Pool {
    /// Creates a pool whose blocks are `size` bytes, logging under `log`.
    ///
    /// This is equivalent to `PoolBuilder::new().size(size).log(log).build()`.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of every block, at least [`MIN_POOL_SIZE`].
    /// * `log` - Span that pool diagnostics are attached to.
    ///
    /// # Errors
    ///
    /// See [`PoolBuilder::build`].
    pub fn create(size: usize, log: Span) -> Result<Self> {
        PoolBuilder::new().size(size).log(log).build()
    }

    /// Runs the cleanups and releases every allocation and block.
    ///
    /// Same as dropping the pool.
    pub fn destroy(self) {
        drop(self);
    }

    /// Releases large payloads and rewinds every block for reuse.
    ///
    /// Cleanup handlers are not run; pending ones are discarded. Block memory
    /// is not zeroed and no block is returned to the allocator.
    pub fn reset(&mut self) {
        self.release_large();

        for block in &mut self.blocks {
            block.rewind();
        }

        self.current = 0;
        self.large.clear();
        self.cleanup.clear();

        tracing::trace!(parent: &self.log, blocks = self.blocks.len(), "pool reset");
    }

    /// Allocates `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes. Up to [`max`](Self::max) they are carved
    ///   from a block, above it they are a large allocation.
    ///
    /// # Returns
    ///
    /// A pointer valid for `size` bytes until [`reset`](Self::reset) or
    /// destruction. The memory is uninitialized.
    ///
    /// # Errors
    ///
    /// Returns the underlying allocator's error when new memory is needed and
    /// cannot be obtained.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, true);
        }
        self.alloc_large(size)
    }

    /// Allocates `size` bytes with no alignment, for byte buffers.
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc).
    #[inline]
    pub fn alloc_unaligned(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, false);
        }
        self.alloc_large(size)
    }

    /// Allocates `size` zero-filled bytes aligned to [`ALIGNMENT`].
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes, routed as in [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        // SAFETY: ptr is valid for size bytes
        unsafe { ptr.write_bytes(0, size) };
        Ok(ptr)
    }

    /// Allocates memory for `layout`.
    ///
    /// Alignments up to [`ALIGNMENT`] follow [`alloc`](Self::alloc); larger
    /// ones are served by [`pmemalign`](Self::pmemalign).
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc) and [`pmemalign`](Self::pmemalign).
    pub fn alloc_layout(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.align() <= ALIGNMENT {
            return self.alloc(layout.size());
        }
        self.pmemalign(layout.size(), layout.align())
    }

    /// Copies `bytes` into unaligned pool memory.
    ///
    /// # Returns
    ///
    /// The pool-owned copy, with the same length as `bytes`.
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc).
    pub fn copy_bytes(&mut self, bytes: &[u8]) -> Result<NonNull<[u8]>> {
        let dst = self.alloc_unaligned(bytes.len())?;
        // SAFETY: dst is valid for bytes.len() bytes and freshly carved
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(NonNull::slice_from_raw_parts(dst, bytes.len()))
    }

    /// Returns the small/large threshold.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Returns the index of the first block probed by small allocations.
    #[must_use]
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Returns the index of the block whose region contains `ptr`.
    #[must_use]
    pub fn block_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| block.contains(ptr.as_ptr()))
    }

    /// Returns a snapshot of the pool's bookkeeping.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            blocks: self.blocks.len(),
            capacity: self.blocks.iter().map(Block::capacity).sum(),
            used: self.blocks.iter().map(Block::used).sum(),
            large_allocations: self.large_allocations(),
            large_nodes: self.large.len(),
            cleanups: self.cleanup.len(),
        }
    }

    /// Carves `size` bytes from the first block that fits, starting at `current`.
    pub(crate) fn alloc_small(&mut self, size: usize, align: bool) -> Result<NonNull<u8>> {
        for block in &mut self.blocks[self.current..] {
            if let Some(ptr) = block.try_carve(size, align) {
                return Ok(ptr);
            }
        }

        self.grow_block(size)
    }

    /// Appends a block sized like the root one and carves `size` bytes from it.
    #[cold]
    fn grow_block(&mut self, size: usize) -> Result<NonNull<u8>> {
        let psize = self.blocks[0].capacity();
        if size > psize {
            return Err(Error::InvalidSize(size));
        }

        let mut block = Block::allocate(self.allocator.as_ref(), psize)?;
        let Some(ptr) = block.try_carve(size, true) else {
            // SAFETY: the block was never handed out
            unsafe { block.release(self.allocator.as_ref()) };
            return Err(Error::InvalidSize(size));
        };

        // Every block probed so far failed once more; retire the chronic ones.
        let last = self.blocks.len() - 1;
        for index in self.current..last {
            let probed = &mut self.blocks[index];
            let failed = probed.failed;
            probed.failed = failed.saturating_add(1);
            if failed > self.max_failed {
                self.current = index + 1;
            }
        }

        self.blocks.push(block);

        tracing::trace!(
            parent: &self.log,
            blocks = self.blocks.len(),
            current = self.current,
            size,
            "pool grew a block"
        );

        Ok(ptr)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.run_cleanups();
        self.release_large();

        // Non-root blocks in chain order, the root block last.
        let mut blocks = std::mem::take(&mut self.blocks).into_iter();
        let root = blocks.next();
        for block in blocks.chain(root) {
            tracing::trace!(
                parent: &self.log,
                block = ?block.as_ptr(),
                unused = block.unused(),
                "free block"
            );
            // SAFETY: every node and payload referencing the block is gone
            unsafe { block.release(self.allocator.as_ref()) };
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max", &self.max)
            .field("current", &self.current)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
