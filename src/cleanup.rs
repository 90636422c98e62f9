//! Deferred cleanup chain.
//!
//! Cleanup nodes tie externally-owned resources to the pool's lifetime. Each
//! node carries an optional pool-allocated data block and a handler that runs
//! once, when the pool is destroyed or earlier on request.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::Result;
use crate::intrusive_list::IntrusiveNode;
use crate::pool::Pool;

/// Signature of a custom cleanup handler. It receives the node's data.
pub type CleanupFn = unsafe fn(data: Option<NonNull<u8>>);

/// What to run for a cleanup node.
#[derive(Debug, Clone, Copy)]
pub enum CleanupHandler {
    /// A caller-supplied function.
    Custom(CleanupFn),
    /// Close the descriptor of a [`FileCleanup`](crate::FileCleanup).
    ///
    /// Attached by [`Pool::cleanup_add_file`]; only nodes registered there
    /// carry data this handler can run on.
    #[cfg(unix)]
    CloseFile,
    /// Delete the file of a [`FileCleanup`](crate::FileCleanup), then close it.
    ///
    /// Attached by [`Pool::cleanup_add_temp_file`], under the same restriction
    /// as [`CloseFile`](Self::CloseFile).
    #[cfg(unix)]
    DeleteFile,
}

impl CleanupHandler {
    /// # Safety
    ///
    /// `data` must be what the handler expects.
    unsafe fn run(self, data: Option<NonNull<u8>>) {
        match self {
            // SAFETY: forwarded from the caller
            Self::Custom(handler) => unsafe { handler(data) },
            #[cfg(unix)]
            Self::CloseFile => {
                if let Some(data) = data {
                    // SAFETY: file handlers are only attached to FileCleanup data
                    crate::file::close_file(unsafe { data.cast().as_ref() });
                }
            }
            #[cfg(unix)]
            Self::DeleteFile => {
                if let Some(data) = data {
                    // SAFETY: file handlers are only attached to FileCleanup data
                    crate::file::delete_file(unsafe { data.cast().as_ref() });
                }
            }
        }
    }
}

/// Payload of a cleanup node.
#[derive(Debug)]
pub struct CleanupEntry {
    pub(crate) data: Option<NonNull<u8>>,
    /// `None` until set, and again once run.
    pub(crate) handler: Option<CleanupHandler>,
}

/// A cleanup node as stored in pool memory.
pub type CleanupNode = IntrusiveNode<CleanupEntry>;

/// Handle to a freshly registered cleanup node.
///
/// The node is already linked; fill in [`data`](Self::data) and attach a
/// handler before releasing the handle.
pub struct Cleanup<'pool> {
    node: NonNull<CleanupNode>,
    _pool: PhantomData<&'pool mut Pool>,
}

impl Cleanup<'_> {
    /// The node's data block, `None` if registered with size 0.
    ///
    /// It is aligned to [`ALIGNMENT`](crate::ALIGNMENT) and uninitialized.
    #[must_use]
    pub fn data(&self) -> Option<NonNull<u8>> {
        // SAFETY: the node lives in the borrowed pool
        unsafe { (*self.node.as_ptr()).data.data }
    }

    /// The currently attached handler.
    #[must_use]
    pub fn handler(&self) -> Option<CleanupHandler> {
        // SAFETY: the node lives in the borrowed pool
        unsafe { (*self.node.as_ptr()).data.handler }
    }

    /// Attaches the handler run at destruction.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - the handler accepts this node's data as it will be when the handler
    ///   runs
    /// - the handler and the data stay valid to use on whichever thread ends
    ///   up dropping the pool, since [`Pool`] is `Send`
    /// - `handler` is a [`CleanupHandler::Custom`]: the file handlers need a
    ///   [`FileCleanup`](crate::FileCleanup), which only
    ///   [`Pool::cleanup_add_file`] and [`Pool::cleanup_add_temp_file`] create
    pub unsafe fn set_handler(&mut self, handler: CleanupHandler) {
        // SAFETY: the node lives in the borrowed pool
        unsafe { (*self.node.as_ptr()).data.handler = Some(handler) };
    }
}

impl Pool {
    /// Registers a cleanup node with a `size`-byte data block.
    ///
    /// The node is linked at the head of the chain with no handler. Nothing is
    /// linked if either allocation fails.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the node's data block; 0 for none. It is allocated
    ///   like [`alloc`](Self::alloc), so it may be a large allocation.
    ///
    /// # Returns
    ///
    /// A handle for filling in the data and attaching a handler.
    ///
    /// # Errors
    ///
    /// Returns the underlying allocator's error.
    pub fn cleanup_add(&mut self, size: usize) -> Result<Cleanup<'_>> {
        let node = self
            .alloc_small(size_of::<CleanupNode>(), true)?
            .cast::<CleanupNode>();

        let data = if size > 0 { Some(self.alloc(size)?) } else { None };

        // SAFETY: node is freshly carved, aligned to ALIGNMENT and sized for a CleanupNode
        unsafe {
            node.write(IntrusiveNode::new(CleanupEntry {
                data,
                handler: None,
            }));
            self.cleanup.push_front(node);
        }

        tracing::debug!(parent: &self.log, cleanup = ?node, "add cleanup");

        Ok(Cleanup {
            node,
            _pool: PhantomData,
        })
    }

    /// Runs every pending handler, most recently registered first.
    pub(crate) fn run_cleanups(&mut self) {
        if self.cleanup.is_empty() {
            return;
        }
        let _entered = self.log.enter();

        for node in self.cleanup.iter() {
            // SAFETY: linked nodes live in pool blocks
            let (handler, data) = unsafe {
                let entry = &mut (*node.as_ptr()).data;
                (entry.handler.take(), entry.data)
            };

            if let Some(handler) = handler {
                tracing::debug!(cleanup = ?node, "run cleanup");
                // SAFETY: set_handler's contract
                unsafe { handler.run(data) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;

    use tracing::Span;

    use super::*;
    use crate::allocator::testing::{Counters, CountingAllocator};
    use crate::block::ALIGNMENT;
    use crate::error::Error;
    use crate::pool::PoolBuilder;

    struct Record {
        log: *const RefCell<Vec<u32>>,
        id: u32,
    }

    unsafe fn record(data: Option<NonNull<u8>>) {
        let record = unsafe { data.unwrap().cast::<Record>().as_ref() };
        unsafe { (*record.log).borrow_mut().push(record.id) };
    }

    fn register(pool: &mut Pool, log: &RefCell<Vec<u32>>, id: u32) {
        let mut cleanup = pool.cleanup_add(size_of::<Record>()).unwrap();
        unsafe {
            cleanup
                .data()
                .unwrap()
                .cast::<Record>()
                .write(Record { log, id });
            cleanup.set_handler(CleanupHandler::Custom(record));
        }
    }

    #[test]
    fn test_destroy_runs_handlers_most_recent_first() {
        let log = RefCell::new(Vec::new());
        let mut pool = Pool::create(1024, Span::none()).unwrap();

        for id in 1..=3 {
            register(&mut pool, &log, id);
        }
        assert!(log.borrow().is_empty());

        pool.destroy();
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_empty_handlers_are_skipped() {
        let log = RefCell::new(Vec::new());
        let mut pool = Pool::create(1024, Span::none()).unwrap();

        register(&mut pool, &log, 1);
        let cleanup = pool.cleanup_add(0).unwrap();
        assert!(cleanup.data().is_none());
        assert!(cleanup.handler().is_none());
        register(&mut pool, &log, 2);

        assert_eq!(pool.stats().cleanups, 3);
        drop(pool);
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_data_is_aligned_and_pool_owned() {
        let mut pool = Pool::create(1024, Span::none()).unwrap();

        let data = pool.cleanup_add(24).unwrap().data().unwrap();
        assert_eq!(data.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(pool.block_of(data), Some(0));

        // Oversized data follows the threshold rule
        let big = pool.cleanup_add(2000).unwrap().data().unwrap();
        assert!(pool.is_large(big));
    }

    #[test]
    fn test_reset_discards_pending_cleanups() {
        let log = RefCell::new(Vec::new());
        let mut pool = Pool::create(1024, Span::none()).unwrap();

        register(&mut pool, &log, 1);
        pool.reset();
        assert_eq!(pool.stats().cleanups, 0);

        register(&mut pool, &log, 2);
        pool.destroy();
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn test_failed_data_allocation_links_nothing() {
        let (allocator, counters) = CountingAllocator::new();
        let mut pool = PoolBuilder::new()
            .size(1024)
            .allocator(allocator)
            .build()
            .unwrap();

        counters.set_fail(true);
        let result = pool.cleanup_add(4096);
        assert_eq!(result.err(), Some(Error::OutOfMemory { size: 4096 }));
        assert_eq!(pool.stats().cleanups, 0);
        // The node was carved and abandoned
        assert!(pool.stats().used > 0);
    }

    #[test]
    fn test_failed_node_allocation_links_nothing() {
        let (allocator, counters) = CountingAllocator::new();
        let mut pool = PoolBuilder::new()
            .size(256)
            .allocator(allocator)
            .build()
            .unwrap();

        pool.alloc(256).unwrap();
        counters.set_fail(true);
        assert!(pool.cleanup_add(8).is_err());
        assert_eq!(pool.stats().cleanups, 0);
    }

    struct Witness {
        counters: *const Counters,
        marker: u64,
        /// Frees seen so far and the marker read back, set by the handler.
        seen: *const Cell<Option<(usize, u64)>>,
    }

    unsafe fn witness(data: Option<NonNull<u8>>) {
        let witness = unsafe { data.unwrap().cast::<Witness>().as_ref() };
        let freed = unsafe { (*witness.counters).freed().len() };
        unsafe { (*witness.seen).set(Some((freed, witness.marker))) };
    }

    #[test]
    fn test_handlers_run_before_large_data_is_released() {
        let (allocator, counters) = CountingAllocator::new();
        let mut pool = PoolBuilder::new()
            .size(1024)
            .allocator(allocator)
            .build()
            .unwrap();
        let seen = Cell::new(None);

        let mut cleanup = pool.cleanup_add(2000).unwrap();
        let data = cleanup.data().unwrap();
        unsafe {
            data.cast::<Witness>().write(Witness {
                counters: Arc::as_ptr(&counters),
                marker: 0xC1EA,
                seen: &seen,
            });
            cleanup.set_handler(CleanupHandler::Custom(witness));
        }
        assert!(pool.is_large(data));

        pool.destroy();
        // Nothing was released before the handler read its data
        assert_eq!(seen.get(), Some((0, 0xC1EA)));
        assert_eq!(counters.freed()[0], data.as_ptr() as usize);
    }
}
