// SPDX-License-Identifier: MPL-2.0

//! Spin-based synchronization primitives.

mod rwlock;
mod spin;

pub use self::{
    rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard, RwTimeout},
    spin::{SpinLock, SpinLockGuard},
};
