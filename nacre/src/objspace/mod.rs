// SPDX-License-Identifier: MPL-2.0

//! Object-space regions and second-level translation.
//!
//! The object address space is carved into fixed-size *regions*; a
//! [`Region`] owns the hardware-visible translation table for one region's
//! span of pages, realized lazily on the first install. An [`Omap`] binds
//! one region to one page-group of one object; objects keep at most one
//! omap per region number.
//!
//! [`ObjectSpace`] is the process-wide context that everything hangs off:
//! the frame pool, the heap the tables are carved from, the region free
//! list and the monotonic region-address reservation counter. It is
//! constructed once at boot and handed around by reference; there is no
//! global instance.

use core::sync::atomic::{AtomicU64, Ordering};

use align_ext::AlignExt;

use nstd::{
    arch::tlb,
    mm::{
        heap::{HeapBlock, KHeap},
        page::{CachePolicy, FramePool, Page},
    },
};

use crate::{
    obj::{ObjId, Object},
    prelude::*,
};

/// The span of one object-space region in bytes.
pub const REGION_SIZE: usize = 2 * 1024 * 1024;

/// The number of base pages covered by one region.
pub const REGION_SPAN_PAGES: u64 = (REGION_SIZE / PAGE_SIZE) as u64;

/// The number of translation entries in a region table.
const REGION_ENTRIES: usize = REGION_SIZE / PAGE_SIZE;

/// The object-space range reserved for the kernel's own mappings. Region
/// reservations start above it and the range is never reused.
const KERNEL_RESERVED_SIZE: u64 = 1 << 32;

/// The top of the translatable object address space.
const MAX_ADDRESS: u64 = 1 << 46;

// One region table must fit exactly one heap block of page size.
const _: () = assert!(REGION_ENTRIES * core::mem::size_of::<u64>() == PAGE_SIZE);
const _: () = assert!(KERNEL_RESERVED_SIZE % REGION_SIZE as u64 == 0);

bitflags::bitflags! {
    /// Flags for installing one translation entry.
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// The mapping aliases a shared pagevec; install it read-only so
        /// the first write traps and can be diverged.
        const COW = 1 << 3;
    }
}

/// Translation entry permission bits. The entry layout is
/// `paddr | perms | memtype`, with the low 12 bits of the page-aligned
/// address free for flags.
pub const ENTRY_READ: u64 = 1 << 0;
pub const ENTRY_WRITE: u64 = 1 << 1;
pub const ENTRY_EXEC: u64 = 1 << 2;
const ENTRY_MEMTYPE_SHIFT: u32 = 3;
const ENTRY_ADDR_MASK: u64 = !0xfff;

fn memtype_bits(cache: CachePolicy) -> u64 {
    let t: u64 = match cache {
        CachePolicy::Writeback => 0,
        CachePolicy::Uncacheable => 1,
        CachePolicy::Writethrough => 2,
        CachePolicy::WriteCombining => 3,
    };
    t << ENTRY_MEMTYPE_SHIFT
}

/// One region of the object address space, owning the translation table
/// for its span.
pub struct Region {
    addr: u64,
    heap: Arc<KHeap>,
    table: RwLock<RegionTable>,
}

struct RegionTable {
    /// The backing table block; `None` until the first install realizes
    /// the table.
    block: Option<HeapBlock>,
    /// Number of non-zero entries.
    live: usize,
}

impl Region {
    fn new(addr: u64, heap: Arc<KHeap>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            heap,
            table: RwLock::new(RegionTable {
                block: None,
                live: 0,
            }),
        })
    }

    /// Returns the region's object-space address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Returns whether the backing table has been realized.
    pub fn is_realized(&self) -> bool {
        self.table.read().block.is_some()
    }

    /// Installs one translation entry, realizing the table if needed.
    ///
    /// [`MapFlags::COW`] strips the write permission so that the first
    /// write to the shared page traps. Returns whether a live entry was
    /// replaced, in which case the caller must shoot down stale
    /// translations before relying on the new one.
    pub fn map_page(&self, idx: usize, page: &Page, flags: MapFlags) -> Result<bool> {
        assert!(idx < REGION_ENTRIES);
        let mut table = self.table.write();
        if table.block.is_none() {
            let block = self.heap.alloc(PAGE_SIZE)?;
            block.zero();
            table.block = Some(block);
        }
        let mut entry = (page.paddr() as u64 & ENTRY_ADDR_MASK) | memtype_bits(page.cache_policy());
        if flags.contains(MapFlags::READ) {
            entry |= ENTRY_READ;
        }
        if flags.contains(MapFlags::WRITE) && !flags.contains(MapFlags::COW) {
            entry |= ENTRY_WRITE;
        }
        if flags.contains(MapFlags::EXEC) {
            entry |= ENTRY_EXEC;
        }
        let replaced = table.set(idx, entry);
        Ok(replaced)
    }

    /// Strips the write permission from `len` entries starting at `start`.
    /// A no-op on an unrealized table.
    pub fn mark_cow(&self, start: usize, len: usize) {
        assert!(start + len <= REGION_ENTRIES);
        let mut table = self.table.write();
        if table.block.is_none() {
            return;
        }
        for i in start..start + len {
            let entry = table.get(i);
            if entry != 0 {
                table.set(i, entry & !ENTRY_WRITE);
            }
        }
    }

    /// Clears `len` entries starting at `start`. A no-op on an unrealized
    /// table.
    pub fn unmap(&self, start: usize, len: usize) {
        assert!(start + len <= REGION_ENTRIES);
        let mut table = self.table.write();
        if table.block.is_none() {
            return;
        }
        for i in start..start + len {
            table.set(i, 0);
        }
    }

    /// Reads one translation entry; `None` if the table is unrealized or
    /// the entry is empty.
    pub fn entry(&self, idx: usize) -> Option<u64> {
        assert!(idx < REGION_ENTRIES);
        let table = self.table.read();
        table.block.as_ref()?;
        let entry = table.get(idx);
        (entry != 0).then_some(entry)
    }

    /// Tears the table down, releasing the backing block.
    fn reset(&self) {
        let mut table = self.table.write();
        table.block = None;
        table.live = 0;
    }
}

impl RegionTable {
    fn entries(&self) -> *mut u64 {
        self.block.as_ref().unwrap().as_ptr() as *mut u64
    }

    fn get(&self, idx: usize) -> u64 {
        // SAFETY: The block is `REGION_ENTRIES * 8` bytes and `idx` is in
        // bounds; all access is serialized by the table lock.
        unsafe { self.entries().add(idx).read() }
    }

    /// Writes one entry, maintaining the live count. Returns whether a
    /// live entry was overwritten with a different live entry.
    fn set(&mut self, idx: usize, entry: u64) -> bool {
        let old = self.get(idx);
        // SAFETY: As in `get`; the write lock is held.
        unsafe { self.entries().add(idx).write(entry) };
        match (old != 0, entry != 0) {
            (true, true) => old != entry,
            (true, false) => {
                self.live -= 1;
                false
            }
            (false, true) => {
                self.live += 1;
                false
            }
            (false, false) => false,
        }
    }
}

/// The binding between an object and the region backing one of its
/// page-groups.
///
/// Lookups hand out clones of the owning `Arc`; the clone is the lookup
/// reference and is dropped after the mapping operation that follows. When
/// the object dies and the last reference drops, the region goes back to
/// the space's free list.
pub struct Omap {
    regnr: u64,
    region: Arc<Region>,
    space: Weak<ObjectSpace>,
}

impl Omap {
    pub(crate) fn new(regnr: u64, region: Arc<Region>, space: Weak<ObjectSpace>) -> Arc<Self> {
        Arc::new(Self {
            regnr,
            region,
            space,
        })
    }

    /// Returns the region number within the object.
    pub fn regnr(&self) -> u64 {
        self.regnr
    }

    /// Returns the backing region.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }
}

impl Drop for Omap {
    fn drop(&mut self) {
        if let Some(space) = self.space.upgrade() {
            space.release_region(self.region.clone());
        }
    }
}

/// The process-wide object-space context.
pub struct ObjectSpace {
    frames: Arc<FramePool>,
    heap: Arc<KHeap>,
    free_regions: SpinLock<Vec<Arc<Region>>>,
    /// The next fresh region address. Monotonic; addresses below it are
    /// only ever reused through the free list.
    next_region_addr: AtomicU64,
    shootdowns: AtomicU64,
}

impl ObjectSpace {
    /// Creates the object-space context over `frames`.
    pub fn new(frames: Arc<FramePool>) -> Arc<Self> {
        let heap = KHeap::new(frames.clone());
        info!(
            "objspace: regions of {} KiB starting at {:#x}",
            REGION_SIZE / 1024,
            KERNEL_RESERVED_SIZE
        );
        Arc::new(Self {
            frames,
            heap,
            free_regions: SpinLock::new(Vec::new()),
            next_region_addr: AtomicU64::new(KERNEL_RESERVED_SIZE),
            shootdowns: AtomicU64::new(0),
        })
    }

    /// Returns the frame pool.
    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    /// Creates an anonymous object in this space.
    pub fn create_object(self: &Arc<Self>, id: ObjId) -> Arc<Object> {
        Object::new(id, self.clone(), None)
    }

    /// Creates an object whose non-resident pages are requested from
    /// `pager`.
    pub fn create_object_with_pager(
        self: &Arc<Self>,
        id: ObjId,
        pager: Arc<dyn crate::collab::Pager>,
    ) -> Arc<Object> {
        Object::new(id, self.clone(), Some(pager))
    }

    /// Reserves `len` bytes of fresh object-space addresses, rounded up to
    /// the region size. Used by the kernel for its own wired mappings.
    pub fn reserve(&self, len: u64) -> Result<u64> {
        let len = len.align_up(REGION_SIZE as u64);
        let addr = self.next_region_addr.fetch_add(len, Ordering::Relaxed);
        if addr + len > MAX_ADDRESS {
            return Err(Error::NoMemory);
        }
        Ok(addr)
    }

    /// Hands out a region, preferring the free list over a fresh
    /// reservation.
    pub(crate) fn allocate_region(&self) -> Result<Arc<Region>> {
        if let Some(region) = self.free_regions.lock().pop() {
            return Ok(region);
        }
        let addr = self
            .next_region_addr
            .fetch_add(REGION_SIZE as u64, Ordering::Relaxed);
        if addr >= MAX_ADDRESS {
            warn!("objspace: region address space exhausted");
            return Err(Error::NoMemory);
        }
        Ok(Region::new(addr, self.heap.clone()))
    }

    /// Returns a region to the free list with its table torn down. The
    /// address is recycled, never the stale translations.
    pub(crate) fn release_region(&self, region: Arc<Region>) {
        region.reset();
        self.invalidate(region.addr as usize, REGION_SIZE);
        self.free_regions.lock().push(region);
    }

    /// Shoots down cached translations for a span of object space.
    pub fn invalidate(&self, addr: Paddr, len: usize) {
        tlb::invalidate(addr, len);
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Shoots down all cached object-space translations.
    pub fn invalidate_all(&self) {
        tlb::invalidate_all();
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of shootdowns issued so far. Lets callers assert that an
    /// operation invalidated before it returned.
    pub fn shootdown_count(&self) -> u64 {
        self.shootdowns.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn free_region_count(&self) -> usize {
        self.free_regions.lock().len()
    }
}

impl core::fmt::Debug for ObjectSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ObjectSpace")
            .field(
                "next_region_addr",
                &format_args!("{:#x}", self.next_region_addr.load(Ordering::Relaxed)),
            )
            .field("shootdowns", &self.shootdowns.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
