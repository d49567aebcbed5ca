// SPDX-License-Identifier: MPL-2.0

//! Object copy: the bulk sharing operation behind clone/derive.
//!
//! Copying never duplicates pages. For every backed source range the
//! destination gains (or re-points) a range aliasing the *same* pagevec at
//! the corresponding offset; divergence happens later, page by page, when
//! a write faults. After a span is shared the whole source span is marked
//! copy-on-write in every region that maps it, stale destination
//! translations are torn down, and one global shootdown is issued before
//! the call returns, so the caller may act on the new protection
//! immediately.
//!
//! Unbacked gaps in the source stay gaps in the destination; the
//! destination reads them as zeros through the ordinary lazy path.

use crate::{
    obj::{pagevec::PageVec, range::RangeTree, Object},
    prelude::*,
};

/// One contiguous span to copy: `pages` pages starting at `src_start` of
/// `src`, landing at `dst_start` of the destination.
pub struct CopySpec {
    pub src: Arc<Object>,
    pub src_start: u64,
    pub dst_start: u64,
    pub pages: u64,
}

/// Copies the spans described by `specs` into `dest`.
///
/// The destination's write lock is held across the whole call; each
/// source's write lock is held while its spec is processed. Copying an
/// object into itself is rejected.
pub fn object_copy(dest: &Arc<Object>, specs: &[CopySpec]) -> Result<()> {
    for spec in specs {
        if Arc::ptr_eq(&spec.src, dest) {
            return Err(Error::InvalidArgs);
        }
    }

    let mut dguard = dest.ranges.write();
    for spec in specs {
        if spec.pages == 0 {
            continue;
        }
        debug!(
            "object_copy: {:?}[{}..{}] <- {:?}[{}..{}]",
            dest.id(),
            spec.dst_start,
            spec.dst_start + spec.pages,
            spec.src.id(),
            spec.src_start,
            spec.src_start + spec.pages
        );
        let sguard = spec.src.ranges.write();
        let mut j = 0;
        while j < spec.pages {
            let srcpg = spec.src_start + j;
            let dstpg = spec.dst_start + j;
            let rem = spec.pages - j;

            let Some(srcrange) = sguard.find(srcpg) else {
                // A gap stays a gap: skip ahead to the next backed source
                // range, or finish the spec if there is none in reach.
                match sguard.find_next(srcpg) {
                    Some(next) if next.start() < srcpg + rem => {
                        j += next.start() - srcpg;
                    }
                    _ => {
                        j += rem;
                    }
                }
                continue;
            };

            let srcoff = srcpg - srcrange.start();
            let avail = srcrange.len() - srcoff;
            let pv = srcrange.pv().clone();
            let pv_off = srcrange.pv_offset() + srcoff;
            let len = rem.min(avail);
            j += share_into(&mut dguard, dstpg, len, pv, pv_off);
        }
        // The source span is now aliased: demote its live translations to
        // read-only and drop any stale destination translations.
        spec.src.mark_cow_span(spec.src_start, spec.pages);
        dest.invalidate_span(spec.dst_start, spec.pages);
        drop(sguard);
    }
    // One global shootdown covers all the demotions above; it must land
    // before the caller observes the copy as complete.
    dest.space.invalidate_all();
    drop(dguard);
    Ok(())
}

/// Points `len` destination pages starting at `dstpg` at `pv` (offset
/// `pv_off`), carving up any pre-existing destination range as needed.
/// Returns how many pages were actually covered.
fn share_into(
    dtree: &mut RangeTree,
    dstpg: u64,
    mut len: u64,
    pv: Arc<PageVec>,
    pv_off: u64,
) -> u64 {
    match dtree.find(dstpg).map(|r| r.start()) {
        None => {
            // Nothing at dstpg; clamp against the next destination range
            // so the new one cannot overlap it.
            if let Some(next) = dtree.find_next(dstpg) {
                if next.start() < dstpg + len {
                    len = next.start() - dstpg;
                }
            }
            dtree.add(pv, dstpg, len, pv_off);
            len
        }
        Some(key) => {
            if key < dstpg {
                // Only the part from dstpg onwards is re-pointed.
                dtree.cut_tail(key, dstpg - key);
            }
            let dr_len = dtree.find(dstpg).expect("range must exist").len();
            if len >= dr_len {
                len = dr_len;
            } else {
                dtree.cut_tail(dstpg, len);
            }
            dtree.replace_pv(dstpg, pv, pv_off);
            len
        }
    }
}
