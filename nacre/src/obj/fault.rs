// SPDX-License-Identifier: MPL-2.0

//! Object-space fault resolution.
//!
//! The architecture trap handler lands here with the faulting instruction
//! pointer, the virtual address and the attempted access. Resolution walks
//! a fixed sequence: resolve the object through the active view, reject
//! null-page touches, ask the security subsystem for the effective
//! permissions, find or populate the backing page (copying it first if the
//! write must diverge from a shared pagevec), and install the translation
//! into the object's region.
//!
//! Every failure that user code can cause is delivered back to the thread
//! as a fault through the [`FaultSink`]; a fault on kernel memory has no
//! such recipient and panics.

use nstd::mm::{page::Page, Vaddr};

use crate::{
    collab::{Access, FaultInfo, FaultSink, Scheduler, Security, View},
    obj::{MapAttrs, OpFlags},
    objspace::MapFlags,
    prelude::*,
    KERNEL_REGION_START, OBJ_MAXSIZE,
};

/// The collaborators a fault is resolved against, bundled so the trap
/// entry can hand them over in one piece.
pub struct FaultContext<'a> {
    pub view: &'a dyn View,
    pub security: &'a dyn Security,
    pub sink: &'a dyn FaultSink,
    pub sched: &'a dyn Scheduler,
}

/// Terminal outcome of a resolved fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The translation was installed; the thread resumes at the faulting
    /// instruction.
    Mapped,
    /// A fault was delivered to the thread instead.
    Raised,
}

/// Resolves one object-space fault.
///
/// Returns an error only for kernel-internal failures (such as memory
/// exhaustion) that the syscall/trap layer must handle; user-caused
/// failures are delivered through the sink and reported as
/// [`FaultOutcome::Raised`].
pub fn handle_fault(
    ctx: &FaultContext<'_>,
    ip: Vaddr,
    vaddr: Vaddr,
    access: Access,
) -> Result<FaultOutcome> {
    if vaddr >= KERNEL_REGION_START {
        panic!(
            "object-space fault on kernel memory (vaddr={:#x}, ip={:#x}, access={:?})",
            vaddr, ip, access
        );
    }

    let Some(obj) = ctx.view.lookup(vaddr) else {
        ctx.sink.raise_fault(FaultInfo::UnresolvedObject { ip, vaddr });
        return Ok(FaultOutcome::Raised);
    };

    let pagenr = (vaddr as u64 % OBJ_MAXSIZE) / PAGE_SIZE as u64;
    if pagenr == 0 {
        ctx.sink.raise_fault(FaultInfo::Null { ip, vaddr });
        return Ok(FaultOutcome::Raised);
    }

    let Some(effective) = ctx.security.resolve_fault(&obj, access, ip, vaddr) else {
        ctx.sink.raise_fault(FaultInfo::PermissionDenied {
            ip,
            vaddr,
            obj: obj.id(),
            requested: access,
        });
        return Ok(FaultOutcome::Raised);
    };
    // The security subsystem grants a superset or denies; anything else is
    // a policy bug upstream.
    assert!(
        effective.contains(access),
        "insufficient effective permissions for a granted fault"
    );

    trace!(
        "fault: obj {:?} page {} access {:?} -> effective {:?}",
        obj.id(),
        pagenr,
        access,
        effective
    );

    let mut opflags = OpFlags::empty();
    if access.contains(Access::WRITE) {
        opflags |= OpFlags::DO_COPY;
    }
    let mapflags = map_flags_for(effective);

    let obj_ref = &obj;
    let mut install = |page: Option<&Page>, attrs: MapAttrs| {
        let page = page.expect("the fault path always materializes a page");
        let mut flags = mapflags;
        if attrs.contains(MapAttrs::COW) {
            flags |= MapFlags::COW;
        }
        obj_ref.map_page_at(pagenr, page, flags)
    };
    obj.operate_on_locked_page(pagenr, opflags, Some(ctx.sched), &mut install)?;

    Ok(FaultOutcome::Mapped)
}

fn map_flags_for(access: Access) -> MapFlags {
    let mut flags = MapFlags::empty();
    if access.contains(Access::READ) {
        flags |= MapFlags::READ;
    }
    if access.contains(Access::WRITE) {
        flags |= MapFlags::WRITE;
    }
    if access.contains(Access::EXEC) {
        flags |= MapFlags::EXEC;
    }
    flags
}
