//! The pool handle that label operations run against, plus the two
//! host-wide registries the in-use probe consults. The label subsystem
//! only ever reads the vdev tree; everything it mutates (the current
//! uberblock, the dirty list, the spare registry) lives here.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::vdev::{vdev_uberblock::Uberblock, Vdev, VdevType};

/// First on-disk version.
pub const VERSION_INITIAL: u64 = 1;
/// Hot spares appeared here.
pub const VERSION_SPARES: u64 = 3;
/// Double-parity raidz appeared here; earlier versions reject nparity > 1.
pub const VERSION_RAIDZ2: u64 = 6;
pub const VERSION_CURRENT: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolState {
    Active,
    Exported,
    Destroyed,
    Spare,
}

impl PoolState {
    pub fn as_u64(&self) -> u64 {
        match self {
            PoolState::Active => 0,
            PoolState::Exported => 1,
            PoolState::Destroyed => 2,
            PoolState::Spare => 3,
        }
    }
}

/// The set of pool GUIDs known to (imported on) this host.
#[derive(Default)]
pub struct PoolRegistry {
    guids: RwLock<HashSet<u64>>,
}

impl PoolRegistry {
    pub fn new() -> Arc<PoolRegistry> {
        Arc::new(PoolRegistry::default())
    }

    pub fn exists(&self, guid: u64) -> bool {
        self.guids.read().contains(&guid)
    }

    pub fn register(&self, guid: u64) {
        self.guids.write().insert(guid);
    }

    pub fn unregister(&self, guid: u64) {
        self.guids.write().remove(&guid);
    }
}

#[derive(Default)]
struct SpareEntry {
    /// Pools that list this spare in their configuration.
    pools: HashSet<u64>,
    /// Pool actively substituting onto this spare, if any.
    active: Option<u64>,
}

/// Host-wide hot spare table. Shared spares may be listed by several
/// pools at once but only one pool can be actively using one.
#[derive(Default)]
pub struct SpareRegistry {
    inner: RwLock<HashMap<u64, SpareEntry>>,
}

impl SpareRegistry {
    pub fn new() -> Arc<SpareRegistry> {
        Arc::new(SpareRegistry::default())
    }

    /// Is this device GUID registered as a spare by any pool?
    pub fn exists(&self, guid: u64) -> bool {
        self.inner.read().contains_key(&guid)
    }

    /// Does `pool` list this spare in its configuration?
    pub fn registered_in(&self, guid: u64, pool: u64) -> bool {
        self.inner
            .read()
            .get(&guid)
            .map(|e| e.pools.contains(&pool))
            .unwrap_or(false)
    }

    /// The pool actively using this spare, if any.
    pub fn active_pool(&self, guid: u64) -> Option<u64> {
        self.inner.read().get(&guid).and_then(|e| e.active)
    }

    pub fn add(&self, guid: u64, pool: u64) {
        self.inner
            .write()
            .entry(guid)
            .or_insert_with(SpareEntry::default)
            .pools
            .insert(pool);
    }

    pub fn activate(&self, guid: u64, pool: u64) {
        if let Some(entry) = self.inner.write().get_mut(&guid) {
            entry.active = Some(pool);
        }
    }

    pub fn deactivate(&self, guid: u64) {
        if let Some(entry) = self.inner.write().get_mut(&guid) {
            entry.active = None;
        }
    }
}

/// A pool as the label subsystem sees it.
pub struct PoolContext {
    pub name: String,
    pub guid: u64,
    pub version: u64,
    pub state: PoolState,
    root: Arc<Vdev>,
    ub: RwLock<Uberblock>,
    /// Pool-wide configuration lock; writer for label_init/config_sync,
    /// reader for read_config/uberblock_load. Held across awaits.
    pub(crate) config_lock: tokio::sync::RwLock<()>,
    dirty: Mutex<Vec<Arc<Vdev>>>,
    written: Mutex<Vec<Arc<Vdev>>>,
    freeze_txg: AtomicU64,
    pools: Arc<PoolRegistry>,
    spares: Arc<SpareRegistry>,
}

impl PoolContext {
    pub fn new(
        name: &str,
        guid: u64,
        version: u64,
        root: Arc<Vdev>,
        pools: Arc<PoolRegistry>,
        spares: Arc<SpareRegistry>,
    ) -> PoolContext {
        assert_eq!(root.vtype(), VdevType::Root);
        pools.register(guid);
        PoolContext {
            name: name.to_string(),
            guid,
            version,
            state: PoolState::Active,
            root,
            ub: RwLock::new(Uberblock::new(version)),
            config_lock: tokio::sync::RwLock::new(()),
            dirty: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            freeze_txg: AtomicU64::new(u64::MAX),
            pools,
            spares,
        }
    }

    pub fn root(&self) -> &Arc<Vdev> {
        &self.root
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn spares(&self) -> &SpareRegistry {
        &self.spares
    }

    /// Snapshot of the current uberblock.
    pub fn uberblock(&self) -> Uberblock {
        *self.ub.read()
    }

    pub fn set_uberblock(&self, ub: Uberblock) {
        *self.ub.write() = ub;
    }

    pub(crate) fn ub_lock(&self) -> &RwLock<Uberblock> {
        &self.ub
    }

    /// Mark a vdev's configuration dirty for the coming sync. The dirty
    /// list holds top-level vdevs; marking the root dirties every
    /// top-level under it.
    pub fn config_dirty(&self, vd: &Arc<Vdev>) {
        if vd.vtype() == VdevType::Root {
            self.dirty_all();
            return;
        }
        let top = vd.top();
        let mut dirty = self.dirty.lock();
        if !dirty.iter().any(|d| d.guid() == top.guid()) {
            dirty.push(top);
        }
    }

    pub(crate) fn dirty_all(&self) {
        let mut dirty = self.dirty.lock();
        dirty.clear();
        for child in self.root.children() {
            dirty.push(child.clone());
        }
    }

    pub(crate) fn dirty_list(&self) -> Vec<Arc<Vdev>> {
        self.dirty.lock().clone()
    }

    pub(crate) fn dirty_is_empty(&self) -> bool {
        self.dirty.lock().is_empty()
    }

    pub(crate) fn config_clean(&self) {
        self.dirty.lock().clear();
    }

    /// Record that `vd` received data writes in the current transaction
    /// group. The Phase-0 barrier of config_sync flushes exactly this
    /// set before any new uberblock may reference the data.
    pub fn note_written(&self, vd: &Arc<Vdev>) {
        let mut written = self.written.lock();
        if !written.iter().any(|w| w.guid() == vd.guid()) {
            written.push(vd.clone());
        }
    }

    pub(crate) fn take_written(&self) -> Vec<Arc<Vdev>> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Debugging hook: transaction groups beyond `txg` are not synced.
    pub fn freeze(&self, txg: u64) {
        self.freeze_txg.store(txg, Ordering::SeqCst);
    }

    pub(crate) fn freeze_txg(&self) -> u64 {
        self.freeze_txg.load(Ordering::SeqCst)
    }
}
