// SPDX-License-Identifier: MPL-2.0

//! Pagevecs: shareable vectors of physical page ownership.
//!
//! A pagevec is the unit of sharing between objects. Every range holds an
//! owning `Arc` to its pagevec, so the strong count *is* the reference
//! count: a pagevec with a strong count above one is implicitly
//! copy-on-write and a writer must split and clone its range before
//! mutating. The frames in the slots are exclusively owned by the pagevec;
//! dropping the last `Arc` frees them through the frame pool.
//!
//! A pagevec has its own spinlock, distinct from any object lock, so that
//! objects sharing it can read and populate slots concurrently. The lock
//! order is always object lock first, pagevec lock second.

use nstd::mm::page::{AllocFlags, FramePool, Page};

use crate::{obj::ObjId, prelude::*};

/// The hard per-pagevec slot capacity. An index at or past this bound
/// forces a fresh pagevec (and a fresh range to carry it).
pub(crate) const PAGEVEC_MAX_SLOTS: usize = 4096;

/// One slot of a pagevec.
enum PageSlot {
    /// No frame yet; reads through the zero-fill path materialize one.
    Empty,
    /// A population (pager fetch) is in flight on another CPU or thread.
    Populating,
    /// The slot owns this frame.
    Present(Page),
}

/// Identifies one range holding a reference to a pagevec, so the sharers
/// can be enumerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HolderTag {
    pub obj: ObjId,
    pub start: u64,
}

/// Outcome of a slot access that could not run the caller's closure.
pub(crate) enum GetPage<R> {
    /// The closure ran against a present frame.
    Done(R),
    /// Another population is in flight; wait and retry.
    WouldBlock,
    /// The slot was empty and is now marked in-flight; the caller must
    /// enqueue a pager request and wait for completion.
    MustPopulate,
}

struct PageVecInner {
    slots: Vec<PageSlot>,
    holders: Vec<HolderTag>,
}

/// A shareable, growable vector of page slots.
pub struct PageVec {
    inner: SpinLock<PageVecInner>,
}

impl PageVec {
    /// Creates an empty pagevec.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(PageVecInner {
                slots: Vec::new(),
                holders: Vec::new(),
            }),
        })
    }

    /// Creates a pagevec with a single empty slot, the shape every lazily
    /// created single-page range starts from.
    pub(crate) fn with_empty_slot() -> Arc<Self> {
        let pv = Self::new();
        pv.inner.lock().slots.push(PageSlot::Empty);
        pv
    }

    /// Returns the number of slots.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Appends one slot, present or empty.
    pub(crate) fn append(&self, page: Option<Page>) {
        let mut inner = self.inner.lock();
        assert!(inner.slots.len() < PAGEVEC_MAX_SLOTS);
        inner.slots.push(match page {
            Some(p) => PageSlot::Present(p),
            None => PageSlot::Empty,
        });
    }

    /// Installs `page` at `idx`, growing the vector as needed. An
    /// overwritten frame is freed.
    pub(crate) fn set(&self, idx: usize, page: Page) {
        assert!(idx < PAGEVEC_MAX_SLOTS);
        let mut inner = self.inner.lock();
        grow_to(&mut inner.slots, idx + 1);
        inner.slots[idx] = PageSlot::Present(page);
    }

    /// Runs `f` against the frame at `idx`.
    ///
    /// An empty slot is zero-filled on the spot when `zero_pool` is given
    /// (anonymous objects); without it the slot is marked in-flight and
    /// [`GetPage::MustPopulate`] tells the caller to involve the pager. A
    /// slot already in flight yields [`GetPage::WouldBlock`].
    pub(crate) fn with_page<R>(
        &self,
        idx: usize,
        zero_pool: Option<&Arc<FramePool>>,
        f: impl FnOnce(&Page) -> R,
    ) -> Result<GetPage<R>> {
        assert!(idx < PAGEVEC_MAX_SLOTS);
        let mut inner = self.inner.lock();
        grow_to(&mut inner.slots, idx + 1);
        if matches!(inner.slots[idx], PageSlot::Populating) {
            return Ok(GetPage::WouldBlock);
        }
        if matches!(inner.slots[idx], PageSlot::Empty) {
            match zero_pool {
                Some(pool) => {
                    let page = pool.alloc(AllocFlags::ZERO)?;
                    inner.slots[idx] = PageSlot::Present(page);
                }
                None => {
                    inner.slots[idx] = PageSlot::Populating;
                    return Ok(GetPage::MustPopulate);
                }
            }
        }
        let PageSlot::Present(page) = &inner.slots[idx] else {
            unreachable!();
        };
        Ok(GetPage::Done(f(page)))
    }

    /// Completes an in-flight population, installing the fetched frame.
    pub(crate) fn complete(&self, idx: usize, page: Page) {
        let mut inner = self.inner.lock();
        grow_to(&mut inner.slots, idx + 1);
        debug_assert!(matches!(inner.slots[idx], PageSlot::Populating));
        inner.slots[idx] = PageSlot::Present(page);
    }

    /// Concatenates `b`'s slots onto `a`. Only legal while neither side is
    /// shared (at most one range each), so no concurrent reader can observe
    /// the splice.
    pub(crate) fn combine(a: &Arc<PageVec>, b: &Arc<PageVec>) {
        let mut a_inner = a.inner.lock();
        let mut b_inner = b.inner.lock();
        assert!(a_inner.holders.len() <= 1 && b_inner.holders.len() <= 1);
        assert!(a_inner.slots.len() + b_inner.slots.len() <= PAGEVEC_MAX_SLOTS);
        a_inner.slots.append(&mut b_inner.slots);
    }

    pub(crate) fn add_holder(&self, tag: HolderTag) {
        self.inner.lock().holders.push(tag);
    }

    pub(crate) fn remove_holder(&self, tag: HolderTag) {
        let mut inner = self.inner.lock();
        let pos = inner
            .holders
            .iter()
            .position(|t| *t == tag)
            .expect("pagevec holder tag must exist");
        inner.holders.swap_remove(pos);
    }

    /// The number of ranges currently holding this pagevec.
    pub(crate) fn holder_count(&self) -> usize {
        self.inner.lock().holders.len()
    }
}

impl core::fmt::Debug for PageVec {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PageVec")
            .field("slots", &inner.slots.len())
            .field("holders", &inner.holders.len())
            .finish()
    }
}

fn grow_to(slots: &mut Vec<PageSlot>, len: usize) {
    while slots.len() < len {
        slots.push(PageSlot::Empty);
    }
}
