// SPDX-License-Identifier: MPL-2.0

//! Subsystem-level tests: fault resolution, copy-on-write isolation,
//! region/omap behavior and the pager population protocol, driven through
//! the public API with hosted stand-ins for the external collaborators.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
    time::Duration,
};

use nstd::mm::{
    page::{AllocFlags, CachePolicy, FramePool, Page},
    Vaddr, PAGE_SIZE,
};

use crate::{
    collab::{Access, FaultInfo, FaultSink, Pager, Scheduler, Security, View, WaitKey},
    obj::{handle_fault, object_copy, CopySpec, FaultContext, FaultOutcome, ObjId, Object},
    objspace::{ObjectSpace, ENTRY_WRITE, REGION_SPAN_PAGES},
    prelude::*,
    OBJ_MAXSIZE,
};

fn space_with(frames: usize) -> Arc<ObjectSpace> {
    let pool = FramePool::new(frames);
    pool.mark_boot_complete();
    ObjectSpace::new(pool)
}

/// Grants everything; the permissive security stand-in.
struct AllowAll;

impl Security for AllowAll {
    fn check_permission(&self, _obj: &Object, _access: Access, _ip: Vaddr) -> bool {
        true
    }

    fn resolve_fault(
        &self,
        _obj: &Object,
        _requested: Access,
        _ip: Vaddr,
        _vaddr: Vaddr,
    ) -> Option<Access> {
        Some(Access::READ | Access::WRITE | Access::EXEC)
    }
}

/// Grants read/exec but denies any write.
struct DenyWrites;

impl Security for DenyWrites {
    fn check_permission(&self, _obj: &Object, access: Access, _ip: Vaddr) -> bool {
        !access.contains(Access::WRITE)
    }

    fn resolve_fault(
        &self,
        _obj: &Object,
        requested: Access,
        _ip: Vaddr,
        _vaddr: Vaddr,
    ) -> Option<Access> {
        if requested.contains(Access::WRITE) {
            return None;
        }
        Some(Access::READ | Access::EXEC)
    }
}

#[derive(Default)]
struct RecordingSink {
    faults: Mutex<Vec<FaultInfo>>,
}

impl FaultSink for RecordingSink {
    fn raise_fault(&self, info: FaultInfo) {
        self.faults.lock().unwrap().push(info);
    }
}

impl RecordingSink {
    fn last(&self) -> Option<FaultInfo> {
        self.faults.lock().unwrap().last().copied()
    }
}

/// Maps object-space slots to objects, like a thread's view table.
#[derive(Default)]
struct SlotView {
    slots: Mutex<HashMap<usize, Arc<Object>>>,
}

impl SlotView {
    fn map_slot(&self, slot: usize, obj: Arc<Object>) {
        self.slots.lock().unwrap().insert(slot, obj);
    }
}

impl View for SlotView {
    fn lookup(&self, vaddr: Vaddr) -> Option<Arc<Object>> {
        self.slots
            .lock()
            .unwrap()
            .get(&(vaddr / OBJ_MAXSIZE as usize))
            .cloned()
    }
}

/// Condvar-backed population waits. Wakes may race with waits, so waits
/// time out and the engine re-checks, as the contract allows.
#[derive(Default)]
struct TestSched {
    gate: Mutex<()>,
    cv: Condvar,
}

impl Scheduler for TestSched {
    fn wait_on(&self, _key: WaitKey) {
        let guard = self.gate.lock().unwrap();
        let _unused = self.cv.wait_timeout(guard, Duration::from_millis(2)).unwrap();
    }

    fn wake_all(&self, _key: WaitKey) {
        let _guard = self.gate.lock().unwrap();
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct TestPager {
    requests: Mutex<Vec<(ObjId, u64)>>,
}

impl Pager for TestPager {
    fn request_object(&self, _id: ObjId) {}

    fn request_page(&self, id: ObjId, pagenr: u64) {
        self.requests.lock().unwrap().push((id, pagenr));
    }
}

/// Everything a fault needs, in one bundle.
struct TestEnv {
    space: Arc<ObjectSpace>,
    view: Arc<SlotView>,
    sink: Arc<RecordingSink>,
    sched: Arc<TestSched>,
}

impl TestEnv {
    fn new(frames: usize) -> Self {
        Self {
            space: space_with(frames),
            view: Arc::new(SlotView::default()),
            sink: Arc::new(RecordingSink::default()),
            sched: Arc::new(TestSched::default()),
        }
    }

    fn fault(&self, vaddr: Vaddr, access: Access) -> Result<FaultOutcome> {
        self.fault_with(&AllowAll, vaddr, access)
    }

    fn fault_with(
        &self,
        security: &dyn Security,
        vaddr: Vaddr,
        access: Access,
    ) -> Result<FaultOutcome> {
        let ctx = FaultContext {
            view: &*self.view,
            security,
            sink: &*self.sink,
            sched: &*self.sched,
        };
        handle_fault(&ctx, 0x1000, vaddr, access)
    }
}

fn vaddr_of(slot: usize, pagenr: u64, offset: usize) -> Vaddr {
    slot * OBJ_MAXSIZE as usize + pagenr as usize * PAGE_SIZE + offset
}

/// The byte offset (as seen by the IO entry points) backing raw page
/// `pagenr`; IO offsets are shifted past the null page internally.
fn io_offset(pagenr: u64) -> usize {
    (pagenr as usize - 1) * PAGE_SIZE
}

fn copy_pages(dest: &Arc<Object>, src: &Arc<Object>, src_start: u64, dst_start: u64, pages: u64) {
    object_copy(
        dest,
        &[CopySpec {
            src: src.clone(),
            src_start,
            dst_start,
            pages,
        }],
    )
    .unwrap();
}

#[test]
fn write_then_read_roundtrip() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    obj.write_data(0, &data).unwrap();
    let mut back = vec![0u8; 4096];
    obj.read_data(0, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn io_spanning_page_boundaries() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 199) as u8).collect();
    obj.write_data(PAGE_SIZE / 2, &data).unwrap();
    let mut back = vec![0u8; data.len()];
    obj.read_data(PAGE_SIZE / 2, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn reads_of_untouched_pages_are_zero() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    let mut buf = [0xffu8; 64];
    obj.read_data(10 * PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 64]);
    // Nothing was materialized by the read.
    assert!(!obj.has_range(11));
}

#[test]
fn io_bounds_are_enforced() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    let mut buf = [0u8; 8];
    assert!(matches!(
        obj.read_data(OBJ_MAXSIZE as usize, &mut buf),
        Err(Error::InvalidArgs)
    ));
    assert!(matches!(
        obj.write_data(OBJ_MAXSIZE as usize - 4, &[0u8; 16]),
        Err(Error::InvalidArgs)
    ));
}

#[test]
fn atomic64_write_lands_and_rejects_misalignment() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    obj.write_data_atomic64(16, 0xdead_beef_cafe_f00d).unwrap();
    let mut buf = [0u8; 8];
    obj.read_data(16, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 0xdead_beef_cafe_f00d);
    assert!(matches!(
        obj.write_data_atomic64(3, 1),
        Err(Error::InvalidArgs)
    ));
}

#[test]
fn cloned_objects_diverge() {
    let space = space_with(64);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    a.write_data(0, b"original page contents").unwrap();
    // Clone A's first data page (raw page 1) into B.
    copy_pages(&b, &a, 1, 1, 1);

    a.write_data(0, &1111u64.to_le_bytes()).unwrap();
    b.write_data(0, &2222u64.to_le_bytes()).unwrap();

    let mut buf = [0u8; 8];
    a.read_data(0, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 1111);
    b.read_data(0, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 2222);
}

#[test]
fn copy_is_isolated_in_both_directions() {
    let space = space_with(128);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    let payload: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 241) as u8).collect();
    a.write_data(0, &payload).unwrap();
    copy_pages(&b, &a, 1, 1, 2);

    // Immediately after the copy B reads what A held.
    let mut back = vec![0u8; payload.len()];
    b.read_data(0, &mut back).unwrap();
    assert_eq!(back, payload);

    // A write into A is invisible to B...
    a.write_data(100, b"mutated-in-a").unwrap();
    b.read_data(0, &mut back).unwrap();
    assert_eq!(back, payload);

    // ...and a write into B is invisible to A.
    b.write_data(200, b"mutated-in-b").unwrap();
    let mut a_back = vec![0u8; payload.len()];
    a.read_data(0, &mut a_back).unwrap();
    assert_eq!(&a_back[..100], &payload[..100]);
    assert_eq!(&a_back[100..112], b"mutated-in-a");
    assert_eq!(&a_back[112..], &payload[112..]);
}

#[test]
fn sharing_and_divergence_tracks_refcounts() {
    let space = space_with(64);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    a.write_data(0, b"shared").unwrap();
    copy_pages(&b, &a, 1, 1, 1);

    // One pagevec, two ranges.
    assert_eq!(a.backing_refcount(1), Some(2));
    assert_eq!(b.backing_refcount(1), Some(2));
    assert_eq!(a.backing_ident(1), b.backing_ident(1));

    // Divergence migrates B away; the original loses exactly B's
    // reference.
    b.write_data(0, b"private").unwrap();
    assert_eq!(a.backing_refcount(1), Some(1));
    assert_eq!(b.backing_refcount(1), Some(1));
    assert_ne!(a.backing_ident(1), b.backing_ident(1));
}

#[test]
fn no_frame_is_freed_twice_or_leaked() {
    let space = space_with(128);
    let frames = space.frames().clone();
    {
        let a = space.create_object(ObjId(0xa));
        let b = space.create_object(ObjId(0xb));
        let payload = vec![0x5a; 3 * PAGE_SIZE];
        a.write_data(0, &payload).unwrap();
        copy_pages(&b, &a, 1, 1, 3);
        // Diverge some of the shared pages in each direction.
        a.write_data(0, b"a-side").unwrap();
        b.write_data(PAGE_SIZE, b"b-side").unwrap();
        assert!(frames.allocated_frames() > 0);
    }
    // Dropping both objects returns every pagevec frame exactly once.
    assert_eq!(frames.allocated_frames(), 0);
}

#[test]
fn source_gaps_stay_gaps() {
    let space = space_with(64);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    // Back only raw page 2; raw pages 1 and 3 stay holes.
    a.write_data(io_offset(2), b"island").unwrap();
    assert!(!a.has_range(1));
    copy_pages(&b, &a, 1, 1, 3);

    // The hole was not materialized in the destination.
    assert!(!b.has_range(1));
    assert!(!b.has_range(3));
    // The backed page arrived, and the hole reads as zeros.
    let mut buf = [0u8; 6];
    b.read_data(io_offset(2), &mut buf).unwrap();
    assert_eq!(&buf, b"island");
    let mut hole = [0xffu8; 16];
    b.read_data(io_offset(1), &mut hole).unwrap();
    assert_eq!(hole, [0u8; 16]);
}

#[test]
fn copy_repoints_existing_destination_ranges() {
    let space = space_with(128);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    let a_data = vec![0x11; 2 * PAGE_SIZE];
    let b_data = vec![0x22; 3 * PAGE_SIZE];
    a.write_data(0, &a_data).unwrap();
    b.write_data(0, &b_data).unwrap();
    // Overwrite only B's middle page with A's first page.
    copy_pages(&b, &a, 1, 2, 1);

    let mut buf = vec![0u8; PAGE_SIZE];
    b.read_data(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0x22));
    b.read_data(PAGE_SIZE, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0x11));
    b.read_data(2 * PAGE_SIZE, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0x22));
}

#[test]
fn copy_issues_a_shootdown_before_returning() {
    let space = space_with(64);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    a.write_data(0, b"x").unwrap();
    let before = space.shootdown_count();
    copy_pages(&b, &a, 1, 1, 1);
    assert!(space.shootdown_count() > before);
}

#[test]
fn copy_into_self_is_rejected() {
    let space = space_with(64);
    let a = space.create_object(ObjId(0xa));
    let res = object_copy(
        &a,
        &[CopySpec {
            src: a.clone(),
            src_start: 1,
            dst_start: 4,
            pages: 1,
        }],
    );
    assert!(matches!(res, Err(Error::InvalidArgs)));
}

#[test]
fn omap_lookup_is_idempotent_and_region_scoped() {
    let space = space_with(64);
    let obj = space.create_object(ObjId(1));
    let first = obj.get_or_create_omap(REGION_SPAN_PAGES * 3 + 5).unwrap();
    assert_eq!(first.regnr(), 3);
    assert!(first.region().addr() % crate::objspace::REGION_SIZE as u64 == 0);

    // A neighboring page reuses the binding: same omap, same region, one
    // more lookup reference, no second allocation.
    let second = obj.get_or_create_omap(REGION_SPAN_PAGES * 3 + 6).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(obj.omap_count(), 1);
    assert!(Arc::strong_count(&first) >= 3);

    // A page in another page-group gets its own binding.
    let other = obj.get_or_create_omap(REGION_SPAN_PAGES * 7).unwrap();
    assert_eq!(other.regnr(), 7);
    assert!(!Arc::ptr_eq(&first, &other));
    assert_ne!(first.region().addr(), other.region().addr());
    assert_eq!(obj.omap_count(), 2);
}

#[test]
fn regions_return_to_the_free_list_on_object_death() {
    let space = space_with(64);
    {
        let obj = space.create_object(ObjId(1));
        let _omap = obj.get_or_create_omap(5).unwrap();
        assert_eq!(space.free_region_count(), 0);
    }
    assert_eq!(space.free_region_count(), 1);
    // The recycled region serves the next object.
    let obj = space.create_object(ObjId(2));
    let _omap = obj.get_or_create_omap(9).unwrap();
    assert_eq!(space.free_region_count(), 0);
}

#[test]
fn fault_maps_and_installs_translation() {
    let env = TestEnv::new(64);
    let obj = env.space.create_object(ObjId(1));
    env.view.map_slot(1, obj.clone());

    let outcome = env.fault(vaddr_of(1, 2, 0), Access::WRITE).unwrap();
    assert_eq!(outcome, FaultOutcome::Mapped);

    let omap = obj.get_or_create_omap(2).unwrap();
    let entry = omap.region().entry(2).expect("translation installed");
    assert_ne!(entry & ENTRY_WRITE, 0);
}

#[test]
fn fault_on_null_page_is_delivered() {
    let env = TestEnv::new(64);
    let obj = env.space.create_object(ObjId(1));
    env.view.map_slot(1, obj);

    let outcome = env.fault(vaddr_of(1, 0, 8), Access::READ).unwrap();
    assert_eq!(outcome, FaultOutcome::Raised);
    assert!(matches!(env.sink.last(), Some(FaultInfo::Null { .. })));
}

#[test]
fn fault_on_unmapped_slot_is_delivered() {
    let env = TestEnv::new(64);
    let outcome = env.fault(vaddr_of(3, 2, 0), Access::READ).unwrap();
    assert_eq!(outcome, FaultOutcome::Raised);
    assert!(matches!(
        env.sink.last(),
        Some(FaultInfo::UnresolvedObject { .. })
    ));
}

#[test]
fn fault_without_permission_is_delivered() {
    let env = TestEnv::new(64);
    let obj = env.space.create_object(ObjId(1));
    env.view.map_slot(1, obj.clone());

    let outcome = env
        .fault_with(&DenyWrites, vaddr_of(1, 2, 0), Access::WRITE)
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Raised);
    match env.sink.last() {
        Some(FaultInfo::PermissionDenied {
            obj: id, requested, ..
        }) => {
            assert_eq!(id, obj.id());
            assert_eq!(requested, Access::WRITE);
        }
        other => panic!("unexpected fault: {:?}", other),
    }
    // Nothing was mapped.
    assert_eq!(obj.omap_count(), 0);
}

#[test]
#[should_panic(expected = "kernel memory")]
fn fault_on_kernel_address_panics() {
    let env = TestEnv::new(64);
    let _ = env.fault(crate::KERNEL_REGION_START + 0x1000, Access::READ);
}

#[test]
fn write_fault_privatizes_shared_backing() {
    let env = TestEnv::new(128);
    let a = env.space.create_object(ObjId(0xa));
    let b = env.space.create_object(ObjId(0xb));
    a.write_data(0, b"to-be-shared").unwrap();
    copy_pages(&b, &a, 1, 1, 1);
    env.view.map_slot(2, b.clone());

    assert_eq!(b.backing_refcount(1), Some(2));
    let outcome = env.fault(vaddr_of(2, 1, 0), Access::WRITE).unwrap();
    assert_eq!(outcome, FaultOutcome::Mapped);

    // B now has a strictly private pagevec; A's is untouched.
    assert_eq!(b.backing_refcount(1), Some(1));
    assert_eq!(a.backing_refcount(1), Some(1));
    assert_ne!(a.backing_ident(1), b.backing_ident(1));
    let mut buf = [0u8; 12];
    a.read_data(0, &mut buf).unwrap();
    assert_eq!(&buf, b"to-be-shared");
}

#[test]
fn read_fault_on_shared_page_maps_copy_on_write() {
    let env = TestEnv::new(128);
    let a = env.space.create_object(ObjId(0xa));
    let b = env.space.create_object(ObjId(0xb));
    a.write_data(0, b"shared").unwrap();
    copy_pages(&b, &a, 1, 1, 1);
    env.view.map_slot(1, a.clone());

    // Read access keeps the sharing and installs a write-protected entry.
    env.fault(vaddr_of(1, 1, 0), Access::READ).unwrap();
    let omap = a.get_or_create_omap(1).unwrap();
    let entry = omap.region().entry(1).expect("translation installed");
    assert_eq!(entry & ENTRY_WRITE, 0);
    assert_eq!(a.backing_refcount(1), Some(2));

    // The write that follows diverges and installs a writable entry.
    env.fault(vaddr_of(1, 1, 0), Access::WRITE).unwrap();
    let entry = omap.region().entry(1).expect("translation installed");
    assert_ne!(entry & ENTRY_WRITE, 0);
    assert_eq!(a.backing_refcount(1), Some(1));
}

#[test]
fn copy_demotes_source_translations_to_read_only() {
    let env = TestEnv::new(128);
    let a = env.space.create_object(ObjId(0xa));
    let b = env.space.create_object(ObjId(0xb));
    env.view.map_slot(1, a.clone());
    a.write_data(0, b"mapped-writable").unwrap();
    // Fault a writable mapping in first.
    env.fault(vaddr_of(1, 1, 0), Access::WRITE).unwrap();
    let omap = a.get_or_create_omap(1).unwrap();
    assert_ne!(omap.region().entry(1).unwrap() & ENTRY_WRITE, 0);

    copy_pages(&b, &a, 1, 1, 1);

    // The copy stripped the write permission from the live translation.
    assert_eq!(omap.region().entry(1).unwrap() & ENTRY_WRITE, 0);
}

#[test]
fn insert_page_maps_device_memory() {
    let env = TestEnv::new(64);
    let obj = env.space.create_object(ObjId(1));
    let mmio = Page::new_fake(0xfee0_0000, CachePolicy::Uncacheable);
    obj.insert_page(4, mmio).unwrap();

    // The eagerly inserted page backs the object without any fault.
    assert!(obj.has_range(4));
    env.view.map_slot(1, obj.clone());
    env.fault(vaddr_of(1, 4, 0), Access::READ).unwrap();
    let omap = obj.get_or_create_omap(4).unwrap();
    let entry = omap.region().entry(4).expect("translation installed");
    assert_eq!(entry & !0xfffu64, 0xfee0_0000 & !0xfffu64);
    // Device memory carries the uncacheable memory type (bits 3..5).
    assert_eq!((entry >> 3) & 0x3, 1);
}

#[test]
fn pager_backed_page_is_requested_and_completed() {
    let env = TestEnv::new(128);
    let pager = Arc::new(TestPager::default());
    let obj = env
        .space
        .create_object_with_pager(ObjId(0x77), pager.clone());
    env.view.map_slot(1, obj.clone());

    let faulter = {
        let env_view = env.view.clone();
        let env_sink = env.sink.clone();
        let env_sched = env.sched.clone();
        std::thread::spawn(move || {
            let ctx = FaultContext {
                view: &*env_view,
                security: &AllowAll,
                sink: &*env_sink,
                sched: &*env_sched,
            };
            let outcome = handle_fault(&ctx, 0x1000, vaddr_of(1, 2, 0), Access::READ).unwrap();
            assert_eq!(outcome, FaultOutcome::Mapped);
        })
    };

    // Wait until the engine asks the pager for the page.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pager.requests.lock().unwrap().contains(&(ObjId(0x77), 2)) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no pager request");
        std::thread::sleep(Duration::from_millis(1));
    }

    // Deliver the page; the faulting thread resumes.
    let page = env.space.frames().alloc(AllocFlags::ZERO).unwrap();
    page.write_bytes(0, b"from-disk");
    obj.complete_population(2, page, &*env.sched).unwrap();
    faulter.join().unwrap();

    let mut buf = [0u8; 9];
    obj.read_data(io_offset(2), &mut buf).unwrap();
    assert_eq!(&buf, b"from-disk");
    // Exactly one request went to the pager.
    assert_eq!(pager.requests.lock().unwrap().len(), 1);
}

#[test]
fn concurrent_faulters_share_one_population() {
    let env = TestEnv::new(128);
    let pager = Arc::new(TestPager::default());
    let obj = env
        .space
        .create_object_with_pager(ObjId(0x88), pager.clone());
    env.view.map_slot(1, obj.clone());

    let spawn_faulter = || {
        let env_view = env.view.clone();
        let env_sink = env.sink.clone();
        let env_sched = env.sched.clone();
        std::thread::spawn(move || {
            let ctx = FaultContext {
                view: &*env_view,
                security: &AllowAll,
                sink: &*env_sink,
                sched: &*env_sched,
            };
            handle_fault(&ctx, 0x1000, vaddr_of(1, 3, 0), Access::READ).unwrap()
        })
    };
    let t1 = spawn_faulter();
    let t2 = spawn_faulter();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while pager.requests.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "no pager request");
        std::thread::sleep(Duration::from_millis(1));
    }
    let page = env.space.frames().alloc(AllocFlags::ZERO).unwrap();
    obj.complete_population(3, page, &*env.sched).unwrap();

    assert_eq!(t1.join().unwrap(), FaultOutcome::Mapped);
    assert_eq!(t2.join().unwrap(), FaultOutcome::Mapped);
    // The second faulter waited on the first population instead of
    // issuing its own request.
    assert_eq!(pager.requests.lock().unwrap().len(), 1);
}

#[test]
fn cross_object_sharing_does_not_deadlock() {
    let space = space_with(256);
    let a = space.create_object(ObjId(0xa));
    let b = space.create_object(ObjId(0xb));
    let payload = vec![0x77u8; 8 * PAGE_SIZE];
    a.write_data(0, &payload).unwrap();
    copy_pages(&b, &a, 1, 1, 8);

    // One thread keeps re-sharing pages from A into B, the other keeps
    // diverging them by writing into both objects. Every path acquires an
    // object lock before any pagevec lock, so this terminates.
    let sharer = {
        let a = a.clone();
        let b = b.clone();
        std::thread::spawn(move || {
            for i in 0..50 {
                let page = 1 + (i % 8) as u64;
                copy_pages(&b, &a, page, page, 1);
            }
        })
    };
    let writer = {
        let a = a.clone();
        let b = b.clone();
        std::thread::spawn(move || {
            for i in 0..50 {
                let page = 1 + (i % 8) as u64;
                a.write_data(io_offset(page), &[i as u8; 32]).unwrap();
                b.write_data(io_offset(page) + 64, &[i as u8; 32]).unwrap();
            }
        })
    };
    sharer.join().unwrap();
    writer.join().unwrap();
}
