// SPDX-License-Identifier: MPL-2.0

//! Ranges: contiguous spans of an object's pages bound to a pagevec.
//!
//! Every object keeps its ranges in an interval tree keyed by start page;
//! ranges of one object never overlap. A range maps page `p` of the object
//! to slot `(p - start) + pv_offset` of its pagevec, which lets two objects
//! share one pagevec while tracking divergent extents after a
//! copy-on-write split.
//!
//! The tree is guarded by the object's reader/writer lock; all the
//! mutating operations here expect to run under the write side.

use nstd::mm::page::FramePool;

use crate::{
    obj::{
        pagevec::{GetPage, HolderTag, PageVec, PAGEVEC_MAX_SLOTS},
        ObjId,
    },
    prelude::*,
};

/// A contiguous span `[start, start + len)` of object pages backed by one
/// pagevec at `pv_offset`.
pub(crate) struct Range {
    obj: ObjId,
    start: u64,
    len: u64,
    pv_offset: u64,
    pv: Arc<PageVec>,
}

impl Range {
    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn pv_offset(&self) -> u64 {
        self.pv_offset
    }

    pub(crate) fn pv(&self) -> &Arc<PageVec> {
        &self.pv
    }

    pub(crate) fn covers(&self, page: u64) -> bool {
        self.start <= page && page < self.start + self.len
    }

    /// The pagevec slot index backing `page`.
    pub(crate) fn pv_idx(&self, page: u64) -> usize {
        debug_assert!(self.covers(page));
        let idx = (page - self.start) + self.pv_offset;
        debug_assert!((idx as usize) < PAGEVEC_MAX_SLOTS);
        idx as usize
    }

    fn tag(&self) -> HolderTag {
        HolderTag {
            obj: self.obj,
            start: self.start,
        }
    }
}

impl Drop for Range {
    fn drop(&mut self) {
        // De-register from the pagevec before the owning `Arc` goes; the
        // frames are freed by the pagevec itself on its last drop.
        self.pv.remove_holder(self.tag());
    }
}

/// The per-object interval tree of ranges.
pub(crate) struct RangeTree {
    obj: ObjId,
    ranges: BTreeMap<u64, Range>,
}

impl RangeTree {
    pub(crate) fn new(obj: ObjId) -> Self {
        Self {
            obj,
            ranges: BTreeMap::new(),
        }
    }

    /// Finds the range covering `page`.
    pub(crate) fn find(&self, page: u64) -> Option<&Range> {
        let (_, range) = self.ranges.range(..=page).next_back()?;
        range.covers(page).then_some(range)
    }

    /// Finds the range covering `page`, or failing that the nearest range
    /// above it.
    pub(crate) fn find_next(&self, page: u64) -> Option<&Range> {
        if let Some(range) = self.find(page) {
            return Some(range);
        }
        self.ranges.range(page..).next().map(|(_, r)| r)
    }

    /// Inserts a new range holding `pv`. Panics if it would overlap an
    /// existing range, which is a kernel bug.
    pub(crate) fn add(&mut self, pv: Arc<PageVec>, start: u64, len: u64, pv_offset: u64) -> u64 {
        assert!(len > 0);
        assert!((pv_offset + len) as usize <= PAGEVEC_MAX_SLOTS);
        if let Some((_, prev)) = self.ranges.range(..=start).next_back() {
            if prev.start + prev.len > start {
                panic!("tried to overwrite an object range");
            }
        }
        if let Some((&next_start, _)) = self.ranges.range(start..).next() {
            if next_start < start + len {
                panic!("tried to overwrite an object range");
            }
        }
        let range = Range {
            obj: self.obj,
            start,
            len,
            pv_offset,
            pv,
        };
        range.pv.add_holder(range.tag());
        self.ranges.insert(start, range);
        start
    }

    /// Shrinks the range at `start_key` to its first `keep` pages; the
    /// remainder becomes a new range sharing the same pagevec.
    pub(crate) fn cut_tail(&mut self, start_key: u64, keep: u64) {
        let range = self.ranges.get_mut(&start_key).expect("range must exist");
        if range.len <= keep {
            return;
        }
        assert!(keep > 0);
        let rest_len = range.len - keep;
        let rest_off = range.pv_offset + keep;
        let pv = range.pv.clone();
        range.len = keep;
        let start = range.start;
        self.add(pv, start + keep, rest_len, rest_off);
    }

    /// Splits the range covering `page` so that `page` sits in a range of
    /// exactly one page, still sharing the original pagevec. Returns the
    /// single-page range's start key (which is `page`).
    pub(crate) fn split_at(&mut self, page: u64) -> u64 {
        let range = self.find(page).expect("range must exist");
        let (start_key, old_len, pv_offset) = (range.start, range.len, range.pv_offset);
        let rel = page - start_key;
        if old_len == 1 {
            return start_key;
        }
        let pv = self.ranges.get(&start_key).unwrap().pv.clone();
        // Shrink the original first so the new parts never overlap it.
        self.ranges.get_mut(&start_key).unwrap().len = if rel > 0 { rel } else { 1 };
        if rel + 1 < old_len {
            // Tail part beyond the isolated page.
            self.add(
                pv.clone(),
                page + 1,
                old_len - (rel + 1),
                pv_offset + rel + 1,
            );
        }
        if rel > 0 {
            // Head keeps the original key; the isolated page gets its own
            // range.
            self.add(pv, page, 1, pv_offset + rel)
        } else {
            start_key
        }
    }

    /// Replaces the pagevec of the range at `start_key` with a freshly
    /// allocated private one, duplicating the backing frames.
    ///
    /// The original pagevec loses this range's reference; the caller is
    /// left with a range whose pagevec has exactly one holder.
    pub(crate) fn clone_private(&mut self, start_key: u64, pool: &Arc<FramePool>) -> Result<()> {
        let range = self.ranges.get(&start_key).expect("range must exist");
        let new_pv = PageVec::new();
        for i in 0..range.len {
            let idx = (range.pv_offset + i) as usize;
            let copy = match range.pv.with_page(idx, Some(pool), |page| page.duplicate())? {
                GetPage::Done(copy) => copy?,
                // A population is in flight on this pagevec; the caller
                // must wait for it and retry the whole operation.
                _ => return Err(Error::WouldBlock),
            };
            new_pv.append(Some(copy));
        }
        let range = self.ranges.get_mut(&start_key).unwrap();
        let tag = range.tag();
        range.pv.remove_holder(tag);
        new_pv.add_holder(tag);
        range.pv = new_pv;
        range.pv_offset = 0;
        debug_assert_eq!(range.pv.holder_count(), 1);
        Ok(())
    }

    /// Swaps the range at `start_key` onto a different pagevec. Used by
    /// object copy to alias a source pagevec into a destination range.
    pub(crate) fn replace_pv(&mut self, start_key: u64, pv: Arc<PageVec>, pv_offset: u64) {
        let range = self.ranges.get_mut(&start_key).expect("range must exist");
        assert!((pv_offset + range.len) as usize <= PAGEVEC_MAX_SLOTS);
        let tag = range.tag();
        range.pv.remove_holder(tag);
        pv.add_holder(tag);
        range.pv = pv;
        range.pv_offset = pv_offset;
    }

    /// Removes the range at `start_key`, dropping its pagevec reference.
    pub(crate) fn remove(&mut self, start_key: u64) -> bool {
        self.ranges.remove(&start_key).is_some()
    }

    #[cfg(test)]
    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
