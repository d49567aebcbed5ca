// SPDX-License-Identifier: MPL-2.0

//! Architecture shims.
//!
//! The engine only depends on two architectural facilities: local-IRQ state
//! save/restore around spinlock critical sections, and second-level TLB
//! shootdown after mappings are torn down or downgraded. The bootstrap
//! implementations here carry the bookkeeping; an architecture port supplies
//! the actual `cli`/`sti` and `invept`-class instructions behind the same
//! functions.

pub mod irq;
pub(crate) mod mm;
pub mod tlb;
