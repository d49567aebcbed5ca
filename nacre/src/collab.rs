// SPDX-License-Identifier: MPL-2.0

//! Interfaces of the external collaborators.
//!
//! The object-memory engine is consulted by traps and syscalls, but the
//! policy decisions belong elsewhere: the security-context subsystem
//! evaluates permissions, the thread layer delivers faults, the view layer
//! resolves virtual addresses to objects, the pager owns durable storage,
//! and the scheduler parks threads. Each of those is reached through one of
//! the traits below.

use nstd::mm::Vaddr;

use crate::{
    obj::{ObjId, Object},
    prelude::*,
};

bitflags::bitflags! {
    /// The kinds of access an operation performs on an object.
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A fault delivered to the faulting thread.
///
/// From the thread's perspective these are indistinguishable from hardware
/// exceptions; it never observes the kernel's internal recovery attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultInfo {
    /// A dereference of an object's permanent null page.
    Null { ip: Vaddr, vaddr: Vaddr },
    /// The security subsystem denied the requested access.
    PermissionDenied {
        ip: Vaddr,
        vaddr: Vaddr,
        obj: ObjId,
        requested: Access,
    },
    /// No object occupies the faulting address in the active view.
    UnresolvedObject { ip: Vaddr, vaddr: Vaddr },
}

/// The security-context subsystem.
pub trait Security {
    /// Returns whether `access` to `obj` is authorized for the given
    /// instruction pointer.
    fn check_permission(&self, obj: &Object, access: Access, ip: Vaddr) -> bool;

    /// The fault-resolution variant: on success returns the *effective*
    /// granted permission set, which may exceed the requested one (e.g. a
    /// capability granting write on top of default read). `None` denies.
    fn resolve_fault(
        &self,
        obj: &Object,
        requested: Access,
        ip: Vaddr,
        vaddr: Vaddr,
    ) -> Option<Access>;
}

/// Fault delivery into the faulting thread.
pub trait FaultSink {
    fn raise_fault(&self, info: FaultInfo);
}

/// The per-thread view: selects which objects occupy which slots of the
/// object space for the current execution context.
pub trait View {
    fn lookup(&self, vaddr: Vaddr) -> Option<Arc<Object>>;
}

/// The pager's request queue. The engine enqueues requests; completions
/// arrive later through [`Object::complete_population`].
///
/// [`Object::complete_population`]: crate::obj::Object::complete_population
pub trait Pager: Send + Sync {
    fn request_object(&self, id: ObjId);
    fn request_page(&self, id: ObjId, pagenr: u64);
}

/// Identifies one in-flight page population.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitKey {
    pub obj: ObjId,
    pub page: u64,
}

/// The scheduler's wait queue for in-flight populations.
///
/// `wait_on` may return spuriously; callers re-check the condition they
/// wait for. `wake_all` releases every thread waiting on the key.
pub trait Scheduler {
    fn wait_on(&self, key: WaitKey);
    fn wake_all(&self, key: WaitKey);
}
