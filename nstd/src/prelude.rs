// SPDX-License-Identifier: MPL-2.0

//! The prelude.

pub use alloc::{boxed::Box, sync::Arc, sync::Weak, vec, vec::Vec};

pub use crate::{
    error::Error,
    mm::{Paddr, Vaddr, PAGE_SIZE},
};

/// A specialized [`Result`] type for this crate.
pub type Result<T> = crate::error::Result<T>;
