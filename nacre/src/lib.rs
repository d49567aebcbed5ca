// SPDX-License-Identifier: MPL-2.0

//! The object-memory subsystem of the Nacre kernel.
//!
//! All physical memory is backed by *objects* addressed by 128-bit IDs and
//! made visible in a flat object address space partitioned into fixed-size
//! slots. This crate implements the translation between (object, offset)
//! pairs and physical pages: page/range tracking over shareable pagevecs,
//! the object-space region layer that owns the second-level translation
//! tables, copy-on-write object cloning, and the fault path that lazily
//! populates pages and installs mappings.
//!
//! The scheduler, security contexts, views and the pager are external
//! collaborators reached through the traits in [`collab`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collab;
pub mod obj;
pub mod objspace;
pub(crate) mod prelude;

#[cfg(test)]
mod test;

pub use obj::{CopySpec, ObjId, Object};
pub use objspace::{ObjectSpace, Omap, Region};

use nstd::mm::Vaddr;

/// The span of one object slot in the object address space. Every object's
/// contents are visible at a page-aligned offset within its slot.
pub const OBJ_MAXSIZE: u64 = 1 << 30;

/// The reserved null page at the start of every object. Faulting on it is a
/// null dereference; the byte-IO entry points shift past it.
pub const OBJ_NULLPAGE_SIZE: usize = nstd::mm::PAGE_SIZE;

/// Start of the kernel's own region of the virtual address space. A fault
/// on a kernel address can never be resolved through an object and is a
/// kernel bug.
pub const KERNEL_REGION_START: Vaddr = 0xffff_8000_0000_0000;
