// SPDX-License-Identifier: MPL-2.0

//! Second-level TLB shootdown.
//!
//! Tearing down or downgrading an object-space mapping is not complete
//! until every CPU has dropped its cached translation; the callers sequence
//! these functions before the triggering operation returns. The bootstrap
//! implementation establishes the same ordering with a full memory fence;
//! an architecture port issues the invalidation instruction here.

use core::sync::atomic::{fence, Ordering};

use crate::mm::Paddr;

/// Invalidates cached translations for `len` bytes of object space
/// starting at `addr`.
pub fn invalidate(addr: Paddr, len: usize) {
    fence(Ordering::SeqCst);
    log::trace!("tlb: invalidate {:#x}..{:#x}", addr, addr + len);
}

/// Invalidates all cached object-space translations on all CPUs.
pub fn invalidate_all() {
    fence(Ordering::SeqCst);
    log::trace!("tlb: invalidate all");
}
