// SPDX-License-Identifier: MPL-2.0

//! The prelude.

#![allow(unused_imports)]

pub(crate) use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

pub(crate) use log::{debug, info, trace, warn};
pub(crate) use nstd::{
    error::Error,
    mm::{Paddr, Vaddr, PAGE_SIZE},
    sync::{RwLock, SpinLock},
};

pub(crate) type Result<T> = nstd::error::Result<T>;
