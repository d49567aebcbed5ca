// SPDX-License-Identifier: MPL-2.0

//! The physical frame pool.
//!
//! The pool owns a linearly mapped arena of base-page frames and hands out
//! [`Page`] descriptors for them. A `Page` is an owning handle: it cannot be
//! cloned, and dropping it returns the frame to the pool, so a frame can
//! never be freed twice. Sharing of physical pages between objects is
//! expressed one level up (at the pagevec/range layer), never by aliasing
//! descriptors.
//!
//! *Fake* pages wrap physical addresses the pool does not own (MMIO
//! ranges); they can be mapped like any other page but are never returned
//! to the free lists, and explicitly freeing one is a fatal logic error.

use alloc::{sync::Arc, vec::Vec};
use core::{
    alloc::Layout,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    arch::mm::paddr_to_vaddr,
    error::Error,
    mm::{Paddr, PAGE_SIZE},
    prelude::Result,
    sync::SpinLock,
};

bitflags::bitflags! {
    /// Allocation request flags.
    pub struct AllocFlags: u32 {
        /// The returned frame must be zero-filled. Without this flag the
        /// contents are unspecified and the caller must zero manually if it
        /// needs zero data.
        const ZERO = 1 << 0;
    }
}

/// The caching mode a frame should be mapped with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Write-back; the default for ordinary memory.
    Writeback,
    /// Uncacheable; device memory.
    Uncacheable,
    /// Write-through.
    Writethrough,
    /// Write-combining; framebuffer-style memory.
    WriteCombining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameKind {
    /// A frame owned by the pool; returned to it when the handle drops.
    Pooled,
    /// A wrapper around memory the pool does not own (e.g. MMIO).
    Fake,
}

/// An owning handle to one physical frame.
pub struct Page {
    paddr: Paddr,
    cache: CachePolicy,
    kind: FrameKind,
    pool: Option<Arc<FramePool>>,
}

impl Page {
    /// Fabricates a descriptor for memory the pool does not own.
    ///
    /// The resulting page can be installed into mappings but its frame is
    /// never recycled, and its contents are not accessible through the
    /// kernel byte helpers.
    pub fn new_fake(paddr: Paddr, cache: CachePolicy) -> Self {
        Self {
            paddr,
            cache,
            kind: FrameKind::Fake,
            pool: None,
        }
    }

    /// Returns the physical address of the frame.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Returns the caching mode of the frame.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    /// Returns whether this is a fake (non-owned) page.
    pub fn is_fake(&self) -> bool {
        self.kind == FrameKind::Fake
    }

    /// Allocates a new frame and copies this frame's contents into it.
    pub fn duplicate(&self) -> Result<Page> {
        if self.is_fake() {
            return Err(Error::InvalidArgs);
        }
        let pool = self.pool.as_ref().unwrap();
        let copy = pool.alloc(AllocFlags::empty())?;
        // SAFETY: Both frames are pool-owned, disjoint, and exclusively
        // referenced by their handles.
        unsafe {
            core::ptr::copy_nonoverlapping(
                paddr_to_vaddr(self.paddr),
                paddr_to_vaddr(copy.paddr),
                PAGE_SIZE,
            );
        }
        Ok(copy)
    }

    /// Fills the frame with zeros.
    pub fn zero(&self) {
        debug_assert!(!self.is_fake());
        // SAFETY: The frame is pool-owned and exclusively referenced.
        unsafe { core::ptr::write_bytes(paddr_to_vaddr(self.paddr), 0, PAGE_SIZE) };
    }

    /// Copies `buf` into the frame at `offset`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        debug_assert!(!self.is_fake());
        assert!(offset + buf.len() <= PAGE_SIZE);
        // SAFETY: The range is inside a pool-owned, exclusively referenced
        // frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                paddr_to_vaddr(self.paddr + offset),
                buf.len(),
            );
        }
    }

    /// Copies `buf.len()` bytes at `offset` out of the frame.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(!self.is_fake());
        assert!(offset + buf.len() <= PAGE_SIZE);
        // SAFETY: The range is inside a pool-owned frame; readers may race
        // with writers only when the caller has already serialized access.
        unsafe {
            core::ptr::copy_nonoverlapping(
                paddr_to_vaddr(self.paddr + offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    /// Stores `val` at `offset` as a single 8-byte atomic write.
    ///
    /// `offset` must be 8-byte aligned.
    pub fn write_u64_atomic(&self, offset: usize, val: u64) {
        debug_assert!(!self.is_fake());
        assert!(offset % 8 == 0 && offset + 8 <= PAGE_SIZE);
        // SAFETY: The address is aligned and inside a pool-owned frame.
        let slot = unsafe { &*(paddr_to_vaddr(self.paddr + offset) as *const AtomicU64) };
        slot.store(val, Ordering::SeqCst);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // Fake frames are not pool property; quietly discard the
        // descriptor.
        if let Some(pool) = self.pool.take() {
            pool.release(self.paddr);
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("cache", &self.cache)
            .field("kind", &self.kind)
            .finish()
    }
}

struct PoolInner {
    /// Next never-allocated frame index; everything below it has been
    /// handed out at least once.
    next_unused: usize,
    /// Frame indices with unspecified contents.
    free: Vec<usize>,
    /// Frame indices known to be zero-filled.
    free_zeroed: Vec<usize>,
}

/// The physical frame pool.
///
/// Constructed once at boot with a fixed number of frames and shared by
/// reference from then on; there is no global instance.
pub struct FramePool {
    base: Paddr,
    nframes: usize,
    inner: SpinLock<PoolInner>,
    /// While true, allocation failure is fatal (the kernel cannot make
    /// progress without memory during bootstrap). Afterwards exhaustion is
    /// reported as [`Error::NoMemory`].
    booting: AtomicBool,
    allocated: AtomicU64,
}

impl FramePool {
    /// Creates a pool backed by `nframes` base pages of fresh memory.
    ///
    /// Panics if the backing arena cannot be reserved; this runs during
    /// bootstrap where there is no caller to report to.
    pub fn new(nframes: usize) -> Arc<Self> {
        assert!(nframes > 0);
        let layout = Layout::from_size_align(nframes * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: The layout is non-zero and page-aligned.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            panic!("frame pool: cannot reserve {} frames at boot", nframes);
        }
        log::info!("frame pool: {} frames at {:p}", nframes, base);
        Arc::new(Self {
            base: base as Paddr,
            nframes,
            inner: SpinLock::new(PoolInner {
                next_unused: 0,
                free: Vec::new(),
                free_zeroed: Vec::new(),
            }),
            booting: AtomicBool::new(true),
            allocated: AtomicU64::new(0),
        })
    }

    /// Marks the end of bootstrap. From now on exhaustion is a recoverable
    /// error instead of a kernel halt.
    pub fn mark_boot_complete(&self) {
        self.booting.store(false, Ordering::Release);
    }

    /// Allocates one frame, zero-filled if requested.
    pub fn alloc(self: &Arc<Self>, flags: AllocFlags) -> Result<Page> {
        let (paddr, zeroed) = self.take_frame(flags)?;
        let page = Page {
            paddr,
            cache: CachePolicy::Writeback,
            kind: FrameKind::Pooled,
            pool: Some(self.clone()),
        };
        if flags.contains(AllocFlags::ZERO) && !zeroed {
            page.zero();
        }
        Ok(page)
    }

    /// Allocates one frame without a descriptor, for metadata that is never
    /// returned to the pool (heap refills, early tables).
    pub fn alloc_raw(&self, flags: AllocFlags) -> Result<Paddr> {
        let (paddr, zeroed) = self.take_frame(flags)?;
        if flags.contains(AllocFlags::ZERO) && !zeroed {
            // SAFETY: A frame just taken from the pool is exclusively ours.
            unsafe { core::ptr::write_bytes(paddr_to_vaddr(paddr), 0, PAGE_SIZE) };
        }
        Ok(paddr)
    }

    /// Explicitly frees a page.
    ///
    /// Freeing a fake page is a fatal logic error; such descriptors wrap
    /// memory the pool has no claim on.
    pub fn free(&self, page: Page) {
        if page.is_fake() {
            panic!("frame pool: tried to free a fake page ({:#x})", page.paddr);
        }
        // The actual release happens in `Page::drop`.
        drop(page);
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated_frames(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the total number of frames in the pool.
    pub fn total_frames(&self) -> usize {
        self.nframes
    }

    fn take_frame(&self, flags: AllocFlags) -> Result<(Paddr, bool)> {
        let mut inner = self.inner.lock();
        // Prefer the zero list for zeroed requests; otherwise burn through
        // the dirty list first and keep the zeroed frames for those who
        // need them.
        let (idx, zeroed) = if flags.contains(AllocFlags::ZERO) {
            if let Some(idx) = inner.free_zeroed.pop() {
                (idx, true)
            } else if inner.next_unused < self.nframes {
                let idx = inner.next_unused;
                inner.next_unused += 1;
                // The arena starts out zero-filled.
                (idx, true)
            } else if let Some(idx) = inner.free.pop() {
                (idx, false)
            } else {
                return self.exhausted();
            }
        } else if let Some(idx) = inner.free.pop() {
            (idx, false)
        } else if let Some(idx) = inner.free_zeroed.pop() {
            (idx, true)
        } else if inner.next_unused < self.nframes {
            let idx = inner.next_unused;
            inner.next_unused += 1;
            (idx, true)
        } else {
            return self.exhausted();
        };
        drop(inner);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok((self.base + idx * PAGE_SIZE, zeroed))
    }

    fn exhausted(&self) -> Result<(Paddr, bool)> {
        if self.booting.load(Ordering::Acquire) {
            panic!("frame pool: out of physical memory during bootstrap");
        }
        log::warn!("frame pool: out of physical memory");
        Err(Error::NoMemory)
    }

    fn release(&self, paddr: Paddr) {
        debug_assert!(paddr >= self.base && paddr < self.base + self.nframes * PAGE_SIZE);
        let idx = (paddr - self.base) / PAGE_SIZE;
        self.inner.lock().free.push(idx);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.nframes * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: `base` was allocated with this exact layout in `new`.
        unsafe { alloc::alloc::dealloc(self.base as *mut u8, layout) };
    }
}
