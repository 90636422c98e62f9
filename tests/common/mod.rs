#![allow(dead_code)]

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ruapc_regionpool::{Allocator, DefaultAllocator, Result};

/// Routes pool diagnostics to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Allocator that tracks how many of its allocations are still live.
#[derive(Clone, Default)]
pub struct TrackingAllocator {
    live: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl TrackingAllocator {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

impl Allocator for TrackingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let ptr = DefaultAllocator.allocate(layout)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(layout.size(), Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.bytes.fetch_sub(layout.size(), Ordering::SeqCst);
        unsafe { DefaultAllocator.deallocate(ptr, layout) };
    }
}
