// SPDX-License-Identifier: MPL-2.0

//! The framework layer of the Nacre kernel.
//!
//! This crate provides the mechanisms that the object-memory subsystem is
//! built on: ticket spinlocks and a reader/writer lock with atomic
//! upgrade/downgrade, the physical frame pool, the slab/arena kernel heap,
//! and thin architecture shims for local-IRQ state and second-level TLB
//! shootdown.
//!
//! The crate is `no_std` + `alloc`; unit tests run hosted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
pub mod mm;
pub mod prelude;
pub mod sync;

pub use self::error::{Error, Result};
