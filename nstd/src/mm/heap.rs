// SPDX-License-Identifier: MPL-2.0

//! The kernel heap: size-classed slab caches plus a bump arena.
//!
//! The slab side serves fixed-size kernel metadata blocks (the big consumer
//! is the object-space region tables, which need one physically contiguous
//! page-sized block each). Frames are taken from the pool one at a time and
//! carved into blocks of the class size; blocks return to their class's
//! free list on drop and frames are never handed back to the pool.
//!
//! The arena side is for boot-phase metadata with a single collective
//! lifetime: allocation is a bump, there is no per-allocation free.

use alloc::{sync::Arc, vec::Vec};
use core::alloc::Layout;

use align_ext::AlignExt;
use static_assertions::const_assert;

use crate::{
    error::Error,
    mm::{
        page::{AllocFlags, FramePool},
        Paddr, PAGE_SIZE,
    },
    prelude::Result,
    sync::SpinLock,
};

/// The block sizes served by the slab caches.
const CLASS_SIZES: [usize; 7] = [64, 128, 256, 512, 1024, 2048, 4096];

const_assert!(CLASS_SIZES[CLASS_SIZES.len() - 1] == PAGE_SIZE);

/// The size-classed slab heap.
pub struct KHeap {
    pool: Arc<FramePool>,
    buckets: [Bucket; CLASS_SIZES.len()],
}

struct Bucket {
    free: SpinLock<Vec<Paddr>>,
}

impl KHeap {
    /// Creates a heap drawing frames from `pool`.
    pub fn new(pool: Arc<FramePool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            buckets: core::array::from_fn(|_| Bucket {
                free: SpinLock::new(Vec::new()),
            }),
        })
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The size is rounded up to the nearest class; requests beyond the
    /// largest class (one page) are invalid.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<HeapBlock> {
        let class = CLASS_SIZES
            .iter()
            .position(|&c| c >= size)
            .ok_or(Error::InvalidArgs)?;
        if let Some(addr) = self.buckets[class].free.lock().pop() {
            return Ok(HeapBlock {
                addr,
                class,
                heap: self.clone(),
            });
        }
        self.refill(class)
    }

    /// Carves a fresh frame into blocks of the class size, keeping one and
    /// stocking the bucket with the rest.
    fn refill(self: &Arc<Self>, class: usize) -> Result<HeapBlock> {
        let frame = self.pool.alloc_raw(AllocFlags::empty())?;
        let block_size = CLASS_SIZES[class];
        let mut free = self.buckets[class].free.lock();
        for off in (block_size..PAGE_SIZE).step_by(block_size) {
            free.push(frame + off);
        }
        drop(free);
        Ok(HeapBlock {
            addr: frame,
            class,
            heap: self.clone(),
        })
    }

    fn release(&self, addr: Paddr, class: usize) {
        self.buckets[class].free.lock().push(addr);
    }

    /// Returns the number of cached free blocks of the class serving
    /// `size`.
    pub fn free_blocks_for(&self, size: usize) -> usize {
        match CLASS_SIZES.iter().position(|&c| c >= size) {
            Some(class) => self.buckets[class].free.lock().len(),
            None => 0,
        }
    }
}

/// An owned block of heap memory; returns to its slab class on drop.
pub struct HeapBlock {
    addr: Paddr,
    class: usize,
    heap: Arc<KHeap>,
}

impl HeapBlock {
    /// Returns the physical address of the block.
    pub fn paddr(&self) -> Paddr {
        self.addr
    }

    /// Returns the usable size of the block.
    pub fn size(&self) -> usize {
        CLASS_SIZES[self.class]
    }

    /// Returns a pointer to the block's memory.
    pub fn as_ptr(&self) -> *mut u8 {
        crate::arch::mm::paddr_to_vaddr(self.addr)
    }

    /// Fills the block with zeros.
    pub fn zero(&self) {
        // SAFETY: The block is exclusively owned and `size()` bytes long.
        unsafe { core::ptr::write_bytes(self.as_ptr(), 0, self.size()) };
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        self.heap.release(self.addr, self.class);
    }
}

// SAFETY: A block is an exclusively owned span of pool memory.
unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

/// A bump arena over pool frames.
///
/// Allocations share one collective lifetime: nothing is freed until the
/// arena itself goes away. Used for boot-phase metadata whose size is not
/// known up front but whose lifetime is the kernel's.
pub struct Arena {
    pool: Arc<FramePool>,
    inner: SpinLock<ArenaInner>,
}

struct ArenaInner {
    chunk: Paddr,
    used: usize,
    cap: usize,
}

impl Arena {
    /// Creates an empty arena drawing frames from `pool`.
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self {
            pool,
            inner: SpinLock::new(ArenaInner {
                chunk: 0,
                used: 0,
                cap: 0,
            }),
        }
    }

    /// Allocates `layout.size()` bytes with the requested alignment.
    pub fn alloc(&self, layout: Layout) -> Result<Paddr> {
        if layout.size() > PAGE_SIZE || layout.align() > PAGE_SIZE {
            return Err(Error::InvalidArgs);
        }
        // `align_up` wants a power of two no smaller than 2.
        let align = layout.align().max(2);
        let mut inner = self.inner.lock();
        let aligned = (inner.chunk + inner.used).align_up(align);
        let end = aligned + layout.size();
        if inner.cap == 0 || end > inner.chunk + inner.cap {
            // Start a fresh chunk; the tail of the old one is wasted, which
            // is acceptable for boot-phase metadata.
            let chunk = self.pool.alloc_raw(AllocFlags::ZERO)?;
            inner.chunk = chunk;
            inner.used = layout.size();
            inner.cap = PAGE_SIZE;
            return Ok(chunk);
        }
        inner.used = (aligned + layout.size()) - inner.chunk;
        Ok(aligned)
    }
}
