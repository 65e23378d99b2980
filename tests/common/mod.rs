//! Builders shared by the integration tests: an in-memory host with its
//! registries, sparse RAM devices and small vdev trees on top of them.
#![allow(dead_code)]

use std::sync::Arc;

use poolstor::{
    core::{BlockDevice, MemDevice},
    pool::{PoolContext, PoolRegistry, SpareRegistry, VERSION_CURRENT},
    vdev::{
        vdev_label::{label_offset, UBERBLOCK_RING_OFFSET, UBERBLOCK_SIZE},
        Vdev,
    },
};

pub const GB: u64 = 1 << 30;
pub const SMALL_DISK: u64 = 16 << 20;

pub struct Host {
    pub pools: Arc<PoolRegistry>,
    pub spares: Arc<SpareRegistry>,
}

impl Host {
    pub fn new() -> Host {
        poolstor::logger::init("info");
        Host {
            pools: PoolRegistry::new(),
            spares: SpareRegistry::new(),
        }
    }
}

pub fn disk(guid: u64, size: u64) -> (Arc<Vdev>, Arc<MemDevice>) {
    let dev = MemDevice::new(&format!("mem-{}", guid), size);
    let vd = Vdev::disk(
        guid,
        9,
        dev.clone() as Arc<dyn BlockDevice>,
        Some(&format!("/dev/mem-{}", guid)),
    );
    (vd, dev)
}

/// A disk vdev over an existing device, as a reimport would build it.
pub fn disk_over(guid: u64, dev: &Arc<MemDevice>) -> Arc<Vdev> {
    Vdev::disk(
        guid,
        9,
        dev.clone() as Arc<dyn BlockDevice>,
        Some(&format!("/dev/mem-{}", guid)),
    )
}

pub struct TestPool {
    pub pool: PoolContext,
    pub top: Arc<Vdev>,
    pub disks: Vec<(Arc<Vdev>, Arc<MemDevice>)>,
}

/// A pool of one mirror over fresh devices. The top-level gets a
/// non-zero metaslab array, as the allocator would have given it.
pub fn mirror_pool(
    host: &Host,
    name: &str,
    pool_guid: u64,
    top_guid: u64,
    leaf_guids: &[u64],
    size: u64,
) -> TestPool {
    let disks: Vec<(Arc<Vdev>, Arc<MemDevice>)> =
        leaf_guids.iter().map(|g| disk(*g, size)).collect();
    mirror_pool_over(host, name, pool_guid, top_guid, disks)
}

/// Same, over devices that already exist (reopen after a simulated
/// crash).
pub fn mirror_pool_over(
    host: &Host,
    name: &str,
    pool_guid: u64,
    top_guid: u64,
    disks: Vec<(Arc<Vdev>, Arc<MemDevice>)>,
) -> TestPool {
    let top = Vdev::mirror(
        top_guid,
        disks.iter().map(|(vd, _)| vd.clone()).collect(),
    );
    top.set_metaslab(32, 30);
    let root = Vdev::root(pool_guid, vec![top.clone()]);
    let pool = PoolContext::new(
        name,
        pool_guid,
        VERSION_CURRENT,
        root,
        host.pools.clone(),
        host.spares.clone(),
    );
    TestPool {
        pool,
        top,
        disks,
    }
}

/// Raw bytes of uberblock cell `n` in slot `l`.
pub async fn read_cell(
    dev: &MemDevice,
    psize: u64,
    l: usize,
    n: u64,
) -> Vec<u8> {
    let mut buf = vec![0u8; UBERBLOCK_SIZE as usize];
    dev.read_at(
        label_offset(psize, l, UBERBLOCK_RING_OFFSET + n * UBERBLOCK_SIZE),
        &mut buf,
    )
    .await
    .unwrap();
    buf
}

/// Raw bytes of a whole label slot.
pub async fn read_label(dev: &MemDevice, psize: u64, l: usize) -> Vec<u8> {
    let mut buf =
        vec![0u8; poolstor::vdev::vdev_label::LABEL_SIZE as usize];
    dev.read_at(label_offset(psize, l, 0), &mut buf).await.unwrap();
    buf
}
