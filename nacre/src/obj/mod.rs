// SPDX-License-Identifier: MPL-2.0

//! Objects and the locked-page operation engine.
//!
//! An object owns two trees: the range tree (which pages are backed, and by
//! which pagevec) under the object's reader/writer lock, and the omap tree
//! (which regions carry its second-level translations) under a spinlock.
//! Everything that touches a page of an object funnels through
//! [`Object::operate_on_locked_page`]: the fault path, the byte-IO paths
//! and eager page insertion all share its lookup/populate/copy-on-write
//! sequence.
//!
//! Lock order, everywhere: object range lock → pagevec lock, and object
//! range lock → omap lock → region table lock. Violating either order is a
//! latent deadlock.

pub(crate) mod pagevec;
pub(crate) mod range;

mod copy;
mod fault;
mod rw;

pub use copy::{object_copy, CopySpec};
pub use fault::{handle_fault, FaultContext, FaultOutcome};

use core::fmt;

use nstd::mm::page::Page;

use crate::{
    collab::{Pager, Scheduler, WaitKey},
    obj::{
        pagevec::{GetPage, PageVec},
        range::RangeTree,
    },
    objspace::{MapFlags, ObjectSpace, Omap, REGION_SPAN_PAGES},
    prelude::*,
};

/// A 128-bit object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId(pub u128);

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjId({:#034x})", self.0)
    }
}

bitflags::bitflags! {
    /// Options for [`Object::operate_on_locked_page`].
    pub(crate) struct OpFlags: u32 {
        /// An unbacked page may be observed as absent (reads as zeros)
        /// instead of being materialized.
        const ZERO_OK = 1 << 0;
        /// The caller will write: a page backed by a shared pagevec must be
        /// split off and privately cloned first.
        const DO_COPY = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Attributes the engine reports to the per-page callback.
    pub(crate) struct MapAttrs: u32 {
        /// The page is still backed by a shared pagevec; any mapping
        /// installed for it must be copy-on-write.
        const COW = 1 << 0;
    }
}

/// A kernel object: the fundamental addressable unit of memory.
///
/// Page 0 of every object is the permanent null page; it is never backed
/// and faulting on it raises a null-dereference fault.
pub struct Object {
    id: ObjId,
    space: Arc<ObjectSpace>,
    pager: Option<Arc<dyn Pager>>,
    ranges: RwLock<RangeTree>,
    omaps: SpinLock<BTreeMap<u64, Arc<Omap>>>,
}

impl Object {
    pub(crate) fn new(
        id: ObjId,
        space: Arc<ObjectSpace>,
        pager: Option<Arc<dyn Pager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            space,
            pager,
            ranges: RwLock::new(RangeTree::new(id)),
            omaps: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Returns the object's ID.
    pub fn id(&self) -> ObjId {
        self.id
    }

    /// Returns the object space this object lives in.
    pub fn space(&self) -> &Arc<ObjectSpace> {
        &self.space
    }

    /// Returns the omap binding this object's page-group containing
    /// `pagenr` to a region, creating the binding (and allocating a
    /// region) on first use.
    ///
    /// The returned clone is the caller's lookup reference; drop it once
    /// the mapping operation it guards is finished. Repeated calls with no
    /// intervening destruction return the same binding.
    pub fn get_or_create_omap(&self, pagenr: u64) -> Result<Arc<Omap>> {
        let regnr = pagenr / REGION_SPAN_PAGES;
        let mut omaps = self.omaps.lock();
        if let Some(omap) = omaps.get(&regnr) {
            return Ok(omap.clone());
        }
        let region = self.space.allocate_region()?;
        trace!(
            "obj {:?}: new omap regnr {} -> region {:#x}",
            self.id,
            regnr,
            region.addr()
        );
        let omap = Omap::new(regnr, region, Arc::downgrade(&self.space));
        omaps.insert(regnr, omap.clone());
        Ok(omap)
    }

    /// Installs one translation for `pagenr` in this object's region,
    /// shooting down the old translation if one was replaced.
    pub(crate) fn map_page_at(&self, pagenr: u64, page: &Page, flags: MapFlags) -> Result<()> {
        let omap = self.get_or_create_omap(pagenr)?;
        let idx = (pagenr % REGION_SPAN_PAGES) as usize;
        let replaced = omap.region().map_page(idx, page, flags)?;
        if replaced {
            self.space
                .invalidate(omap.region().addr() as usize + idx * PAGE_SIZE, PAGE_SIZE);
        }
        Ok(())
    }

    /// Eagerly installs `page` as the backing of `pagenr`.
    ///
    /// Used by device setup (MMIO frames) and the bootstrap loader; the
    /// page number is raw, not shifted past the null page.
    pub fn insert_page(&self, pagenr: u64, page: Page) -> Result<()> {
        let mut wguard = self.ranges.write();
        if wguard.find(pagenr).is_none() {
            wguard.add(PageVec::with_empty_slot(), pagenr, 1, 0);
        }
        let range = wguard.find(pagenr).expect("range must exist");
        let idx = (pagenr - range.start()) + range.pv_offset();
        if idx as usize >= pagevec::PAGEVEC_MAX_SLOTS {
            // Slot index overflow: give this page a fresh pagevec of its
            // own.
            let key = wguard.split_at(pagenr);
            wguard.replace_pv(key, PageVec::with_empty_slot(), 0);
        }
        let range = wguard.find(pagenr).expect("range must exist");
        range.pv().set(range.pv_idx(pagenr), page);
        Ok(())
    }

    /// Completes an in-flight pager population of `pagenr` with the
    /// fetched frame and wakes the waiting threads.
    pub fn complete_population(
        &self,
        pagenr: u64,
        page: Page,
        sched: &dyn Scheduler,
    ) -> Result<()> {
        let rguard = self.ranges.read();
        let range = rguard.find(pagenr).ok_or(Error::NotFound)?;
        range.pv().complete(range.pv_idx(pagenr), page);
        drop(rguard);
        sched.wake_all(WaitKey {
            obj: self.id,
            page: pagenr,
        });
        Ok(())
    }

    /// The shared engine behind faults and byte IO: locates (or lazily
    /// creates) the range, pagevec and page backing `pagenr`, applies the
    /// copy-on-write policy, and runs `f` against the result with the
    /// pagevec locked.
    ///
    /// With [`OpFlags::ZERO_OK`], an unbacked page is reported to `f` as
    /// `None` instead of being materialized. With [`OpFlags::DO_COPY`], a
    /// page on a shared pagevec is split off and privately cloned before
    /// `f` runs; otherwise `f` is told to treat the mapping as
    /// copy-on-write via [`MapAttrs::COW`].
    ///
    /// In-flight pager populations are waited out through `sched`; `None`
    /// spins in place (only sensible for anonymous objects, which never
    /// block).
    pub(crate) fn operate_on_locked_page(
        &self,
        pagenr: u64,
        flags: OpFlags,
        sched: Option<&dyn Scheduler>,
        f: &mut dyn FnMut(Option<&Page>, MapAttrs) -> Result<()>,
    ) -> Result<()> {
        let anon_pool = self.pager.is_none().then(|| self.space.frames());
        loop {
            let mut rguard = self.ranges.read();
            if rguard.find(pagenr).is_none() {
                if flags.contains(OpFlags::ZERO_OK) {
                    return f(None, MapAttrs::empty());
                }
                let mut wguard = rguard.upgrade();
                if wguard.find(pagenr).is_none() {
                    wguard.add(PageVec::with_empty_slot(), pagenr, 1, 0);
                }
                rguard = wguard.downgrade();
            }

            // Make sure the backing slot is present before deciding
            // anything about copies.
            let range = rguard.find(pagenr).expect("range must exist");
            match range.pv().with_page(range.pv_idx(pagenr), anon_pool, |_| ())? {
                GetPage::Done(()) => {}
                GetPage::MustPopulate => {
                    let pager = self.pager.clone().expect("populate implies a pager");
                    drop(rguard);
                    pager.request_page(self.id, pagenr);
                    self.wait_for_population(pagenr, sched);
                    continue;
                }
                GetPage::WouldBlock => {
                    drop(rguard);
                    self.wait_for_population(pagenr, sched);
                    continue;
                }
            }

            // Copy-on-write decision. The strong count of the pagevec is
            // its reference count; above one means it is shared and a
            // writer must diverge first.
            let shared = Arc::strong_count(range.pv()) > 1;
            let mut attrs = MapAttrs::empty();
            if shared {
                if flags.contains(OpFlags::DO_COPY) {
                    let mut wguard = rguard.upgrade();
                    // The upgrade may have dropped the lock when contended;
                    // revalidate before splitting.
                    if wguard.find(pagenr).is_none() {
                        continue;
                    }
                    if Arc::strong_count(wguard.find(pagenr).unwrap().pv()) > 1 {
                        let key = wguard.split_at(pagenr);
                        match wguard.clone_private(key, self.space.frames()) {
                            Ok(()) => {}
                            Err(Error::WouldBlock) => {
                                drop(wguard);
                                self.wait_for_population(pagenr, sched);
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    rguard = wguard.downgrade();
                } else {
                    attrs |= MapAttrs::COW;
                }
            }

            let range = rguard.find(pagenr).expect("range must exist");
            match range
                .pv()
                .with_page(range.pv_idx(pagenr), anon_pool, |page| f(Some(page), attrs))?
            {
                GetPage::Done(res) => return res,
                // The backing changed under a contended upgrade (e.g. a
                // concurrent copy re-pointed the range); go through the
                // population protocol again.
                GetPage::MustPopulate => {
                    let pager = self.pager.clone().expect("populate implies a pager");
                    drop(rguard);
                    pager.request_page(self.id, pagenr);
                    self.wait_for_population(pagenr, sched);
                }
                GetPage::WouldBlock => {
                    drop(rguard);
                    self.wait_for_population(pagenr, sched);
                }
            }
        }
    }

    fn wait_for_population(&self, pagenr: u64, sched: Option<&dyn Scheduler>) {
        match sched {
            Some(s) => s.wait_on(WaitKey {
                obj: self.id,
                page: pagenr,
            }),
            None => core::hint::spin_loop(),
        }
    }

    /// Strips the write permission from every live translation of pages
    /// `[start, start + count)`, making the span copy-on-write.
    pub(crate) fn mark_cow_span(&self, start: u64, count: u64) {
        self.for_each_covering_omap(start, count, |omap, s, l| {
            omap.region().mark_cow(s, l);
        });
    }

    /// Tears down every live translation of pages `[start, start + count)`.
    pub(crate) fn invalidate_span(&self, start: u64, count: u64) {
        self.for_each_covering_omap(start, count, |omap, s, l| {
            omap.region().unmap(s, l);
        });
    }

    fn for_each_covering_omap(&self, start: u64, count: u64, f: impl Fn(&Omap, usize, usize)) {
        if count == 0 {
            return;
        }
        let end = start + count;
        let omaps = self.omaps.lock();
        for (&regnr, omap) in omaps.range(start / REGION_SPAN_PAGES..=(end - 1) / REGION_SPAN_PAGES)
        {
            let rbase = regnr * REGION_SPAN_PAGES;
            let s = start.max(rbase);
            let e = end.min(rbase + REGION_SPAN_PAGES);
            f(omap, (s - rbase) as usize, (e - s) as usize);
        }
    }

    #[cfg(test)]
    pub(crate) fn backing_refcount(&self, pagenr: u64) -> Option<usize> {
        let rguard = self.ranges.read();
        rguard.find(pagenr).map(|r| Arc::strong_count(r.pv()))
    }

    #[cfg(test)]
    pub(crate) fn backing_ident(&self, pagenr: u64) -> Option<usize> {
        let rguard = self.ranges.read();
        rguard.find(pagenr).map(|r| Arc::as_ptr(r.pv()) as usize)
    }

    #[cfg(test)]
    pub(crate) fn has_range(&self, pagenr: u64) -> bool {
        self.ranges.read().find(pagenr).is_some()
    }

    #[cfg(test)]
    pub(crate) fn omap_count(&self) -> usize {
        self.omaps.lock().len()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("pager", &self.pager.is_some())
            .finish_non_exhaustive()
    }
}
