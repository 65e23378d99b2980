//! The virtual device tree. Interior nodes aggregate (mirror, raidz),
//! leaves are physical devices; the label subsystem reads the tree and
//! writes derived bytes to the leaves, it never changes the shape of
//! the tree itself.
//!
//! Parent and top pointers are `Weak` back-references: the tree is owned
//! top-down and the back-references are lookup-only, so dropping the
//! root drops everything.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    core::BlockDevice,
    vdev::vdev_label::LABEL_SIZE,
};

pub mod vdev_config;
pub mod vdev_init;
pub mod vdev_label;
pub mod vdev_sync;
pub mod vdev_uberblock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VdevType {
    Root,
    Mirror,
    Raidz,
    Disk,
}

impl VdevType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdevType::Root => "root",
            VdevType::Mirror => "mirror",
            VdevType::Raidz => "raidz",
            VdevType::Disk => "disk",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, VdevType::Disk)
    }
}

/// Fixed-shape runtime statistics record attached to a config when the
/// caller asks for stats. The array layout is part of the label format.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct VdevStats {
    pub read_ops: u64,
    pub write_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

impl VdevStats {
    pub(crate) fn as_record(&self) -> Vec<u64> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        vec![
            timestamp,
            self.read_ops,
            self.write_ops,
            self.bytes_read,
            self.bytes_written,
            self.read_errors,
            self.write_errors,
            self.checksum_errors,
        ]
    }
}

pub struct Vdev {
    vtype: VdevType,
    id: AtomicU64,
    guid: AtomicU64,
    guid_sum: AtomicU64,
    nparity: u64,
    this: RwLock<Weak<Vdev>>,
    parent: RwLock<Weak<Vdev>>,
    top: RwLock<Weak<Vdev>>,
    children: Vec<Arc<Vdev>>,

    // leaf bookkeeping
    device: RwLock<Option<Arc<dyn BlockDevice>>>,
    pub path: Option<String>,
    pub devid: Option<String>,
    pub physpath: Option<String>,
    pub wholedisk: bool,
    ashift: AtomicU64,
    asize: AtomicU64,
    dtl_object: AtomicU64,

    // top-level bookkeeping
    ms_array: AtomicU64,
    ms_shift: AtomicU64,
    islog: AtomicBool,

    // state
    offline: AtomicBool,
    tmpoffline: AtomicBool,
    faulted: AtomicBool,
    degraded: AtomicBool,
    removed: AtomicBool,
    unspare: AtomicBool,
    not_present: AtomicBool,
    is_spare: AtomicBool,

    stats: Mutex<VdevStats>,
}

impl Vdev {
    fn alloc(
        vtype: VdevType,
        guid: u64,
        nparity: u64,
        path: Option<&str>,
        children: Vec<Arc<Vdev>>,
    ) -> Arc<Vdev> {
        let vd = Arc::new(Vdev {
            vtype,
            id: AtomicU64::new(0),
            guid: AtomicU64::new(guid),
            guid_sum: AtomicU64::new(guid),
            nparity,
            this: RwLock::new(Weak::new()),
            parent: RwLock::new(Weak::new()),
            top: RwLock::new(Weak::new()),
            children,
            device: RwLock::new(None),
            path: path.map(|p| p.to_string()),
            devid: None,
            physpath: None,
            wholedisk: false,
            ashift: AtomicU64::new(0),
            asize: AtomicU64::new(0),
            dtl_object: AtomicU64::new(0),
            ms_array: AtomicU64::new(0),
            ms_shift: AtomicU64::new(0),
            islog: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            tmpoffline: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            unspare: AtomicBool::new(false),
            not_present: AtomicBool::new(false),
            is_spare: AtomicBool::new(false),
            stats: Mutex::new(VdevStats::default()),
        });
        *vd.this.write() = Arc::downgrade(&vd);
        vd
    }

    /// A strong reference to this vdev itself.
    fn arc(&self) -> Arc<Vdev> {
        self.this.read().upgrade().unwrap()
    }

    /// A leaf backed by a physical device.
    pub fn disk(
        guid: u64,
        ashift: u64,
        device: Arc<dyn BlockDevice>,
        path: Option<&str>,
    ) -> Arc<Vdev> {
        let vd = Vdev::alloc(VdevType::Disk, guid, 0, path, Vec::new());
        vd.ashift.store(ashift, Ordering::SeqCst);
        let size = device.size_in_bytes();
        vd.asize.store(size & !(LABEL_SIZE - 1), Ordering::SeqCst);
        *vd.device.write() = Some(device);
        vd
    }

    pub fn mirror(guid: u64, children: Vec<Arc<Vdev>>) -> Arc<Vdev> {
        Vdev::alloc(VdevType::Mirror, guid, 0, None, children)
    }

    pub fn raidz(
        guid: u64,
        nparity: u64,
        children: Vec<Arc<Vdev>>,
    ) -> Arc<Vdev> {
        Vdev::alloc(VdevType::Raidz, guid, nparity, None, children)
    }

    /// The pool root. Assembling the root wires child ids, parent and
    /// top back-references and computes `guid_sum` bottom-up.
    pub fn root(guid: u64, children: Vec<Arc<Vdev>>) -> Arc<Vdev> {
        let root = Vdev::alloc(VdevType::Root, guid, 0, None, children);
        root.wire(None, None);
        root
    }

    fn wire(
        &self,
        parent: Option<&Arc<Vdev>>,
        top: Option<&Arc<Vdev>>,
    ) -> u64 {
        if let Some(parent) = parent {
            *self.parent.write() = Arc::downgrade(parent);
        }
        let self_arc = self.arc();
        let top = match (parent, top) {
            // children of the root are the top-level vdevs
            (Some(p), _) if p.vtype == VdevType::Root => Some(&self_arc),
            (_, Some(t)) => Some(t),
            _ => None,
        };
        if let Some(t) = top {
            *self.top.write() = Arc::downgrade(t);
        }
        let mut sum = self.guid();
        for (id, child) in self.children.iter().enumerate() {
            child.id.store(id as u64, Ordering::SeqCst);
            sum = sum.wrapping_add(child.wire(Some(&self_arc), top));
        }
        self.guid_sum.store(sum, Ordering::SeqCst);
        sum
    }

    pub fn vtype(&self) -> VdevType {
        self.vtype
    }

    pub fn is_leaf(&self) -> bool {
        self.vtype.is_leaf()
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn guid(&self) -> u64 {
        self.guid.load(Ordering::SeqCst)
    }

    pub fn guid_sum(&self) -> u64 {
        self.guid_sum.load(Ordering::SeqCst)
    }

    pub fn nparity(&self) -> u64 {
        self.nparity
    }

    pub fn children(&self) -> &[Arc<Vdev>] {
        &self.children
    }

    pub fn parent(&self) -> Option<Arc<Vdev>> {
        self.parent.read().upgrade()
    }

    /// The top-level vdev of this subtree; a top-level (or the root)
    /// returns itself.
    pub fn top(&self) -> Arc<Vdev> {
        self.top.read().upgrade().unwrap_or_else(|| self.arc())
    }

    pub fn is_top(&self) -> bool {
        self.parent()
            .map(|p| p.vtype == VdevType::Root)
            .unwrap_or(false)
    }

    /// Display name; the device path if there is one.
    pub fn name(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.vtype.as_str(), self.guid()))
    }

    /// Post-order list of the leaves of this subtree.
    pub fn leaves(&self) -> Vec<Arc<Vdev>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<Arc<Vdev>>) {
        if self.is_leaf() {
            out.push(self.arc());
            return;
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }

    /// Rewrite this vdev's GUID, adjusting `guid_sum` by the delta at
    /// every ancestor. A single upward walk keeps the recursive
    /// invariant without touching the rest of the tree.
    pub fn set_guid(&self, new_guid: u64) {
        let old = self.guid.swap(new_guid, Ordering::SeqCst);
        let delta = new_guid.wrapping_sub(old);
        self.guid_sum.fetch_add(delta, Ordering::SeqCst);
        let mut node = self.parent();
        while let Some(vd) = node {
            vd.guid_sum.fetch_add(delta, Ordering::SeqCst);
            node = vd.parent();
        }
    }

    pub fn device(&self) -> Option<Arc<dyn BlockDevice>> {
        self.device.read().clone()
    }

    pub fn set_device(&self, device: Option<Arc<dyn BlockDevice>>) {
        *self.device.write() = device;
    }

    /// Usable physical size: the device size rounded down to a whole
    /// number of label slots.
    pub fn psize(&self) -> u64 {
        self.device
            .read()
            .as_ref()
            .map(|d| d.size_in_bytes() & !(LABEL_SIZE - 1))
            .unwrap_or(0)
    }

    pub fn is_dead(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
            || self.removed.load(Ordering::SeqCst)
            || self.not_present.load(Ordering::SeqCst)
            || (self.is_leaf() && self.device.read().is_none())
    }

    pub fn readable(&self) -> bool {
        !self.is_dead()
    }

    pub fn writeable(&self) -> bool {
        self.readable() && !self.offline.load(Ordering::SeqCst)
    }

    pub fn ashift(&self) -> u64 {
        self.ashift.load(Ordering::SeqCst)
    }

    pub fn asize(&self) -> u64 {
        self.asize.load(Ordering::SeqCst)
    }

    pub fn set_asize(&self, asize: u64) {
        self.asize.store(asize, Ordering::SeqCst);
    }

    pub fn dtl_object(&self) -> u64 {
        self.dtl_object.load(Ordering::SeqCst)
    }

    pub fn set_dtl_object(&self, obj: u64) {
        self.dtl_object.store(obj, Ordering::SeqCst);
    }

    /// Metaslab bookkeeping, set by the allocator once a top-level has
    /// been initialized for allocation.
    pub fn set_metaslab(&self, ms_array: u64, ms_shift: u64) {
        self.ms_array.store(ms_array, Ordering::SeqCst);
        self.ms_shift.store(ms_shift, Ordering::SeqCst);
    }

    pub fn ms_array(&self) -> u64 {
        self.ms_array.load(Ordering::SeqCst)
    }

    pub fn ms_shift(&self) -> u64 {
        self.ms_shift.load(Ordering::SeqCst)
    }

    pub fn is_log(&self) -> bool {
        self.islog.load(Ordering::SeqCst)
    }

    pub fn set_log(&self, islog: bool) {
        self.islog.store(islog, Ordering::SeqCst);
    }

    pub fn offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool, temporary: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        self.tmpoffline.store(offline && temporary, Ordering::SeqCst);
    }

    pub fn offline_temporary(&self) -> bool {
        self.tmpoffline.load(Ordering::SeqCst)
    }

    pub fn faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::SeqCst);
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn set_removed(&self, removed: bool) {
        self.removed.store(removed, Ordering::SeqCst);
    }

    pub fn unspare(&self) -> bool {
        self.unspare.load(Ordering::SeqCst)
    }

    pub fn set_unspare(&self, unspare: bool) {
        self.unspare.store(unspare, Ordering::SeqCst);
    }

    pub fn not_present(&self) -> bool {
        self.not_present.load(Ordering::SeqCst)
    }

    pub fn set_not_present(&self, not_present: bool) {
        self.not_present.store(not_present, Ordering::SeqCst);
    }

    pub fn is_spare(&self) -> bool {
        self.is_spare.load(Ordering::SeqCst)
    }

    pub fn set_is_spare(&self, is_spare: bool) {
        self.is_spare.store(is_spare, Ordering::SeqCst);
    }

    pub fn stats(&self) -> VdevStats {
        *self.stats.lock()
    }

    pub(crate) fn account_read(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.read_ops += 1;
        stats.bytes_read += bytes;
    }

    pub(crate) fn account_write(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.write_ops += 1;
        stats.bytes_written += bytes;
    }

    pub(crate) fn account_read_error(&self) {
        self.stats.lock().read_errors += 1;
    }

    pub(crate) fn account_write_error(&self) {
        self.stats.lock().write_errors += 1;
    }

    pub(crate) fn account_checksum_error(&self) {
        self.stats.lock().checksum_errors += 1;
    }
}

impl std::fmt::Debug for Vdev {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vdev")
            .field("type", &self.vtype)
            .field("guid", &self.guid())
            .field("children", &self.children.len())
            .finish()
    }
}
