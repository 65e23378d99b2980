//! Uberblock election: the loader scans every cell of every slot of
//! every readable leaf and returns the lexicographic maximum on
//! (txg, timestamp) among the cells that verify.

use poolstor::{
    core::BlockDevice,
    pool::VERSION_CURRENT,
    vdev::{
        vdev_label::{label_offset, LabelInitReason, UBERBLOCK_RING_OFFSET, UBERBLOCK_SIZE},
        vdev_uberblock::Uberblock,
    },
};

mod common;
use common::{mirror_pool, Host, SMALL_DISK};

fn ub(txg: u64, timestamp: u64) -> Uberblock {
    let mut ub = Uberblock::new(VERSION_CURRENT);
    ub.txg = txg;
    ub.timestamp = timestamp;
    ub
}

/// Plant an uberblock into cell `n` of slot `l` of a raw device.
async fn plant(
    dev: &poolstor::core::MemDevice,
    psize: u64,
    l: usize,
    n: u64,
    ub: &Uberblock,
) {
    let cell = ub.to_cell().unwrap();
    dev.write_at(
        label_offset(psize, l, UBERBLOCK_RING_OFFSET + n * UBERBLOCK_SIZE),
        cell.as_slice(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn fresh_devices_have_no_uberblock() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    assert_eq!(tp.pool.uberblock_load(tp.pool.root()).await, None);
}

#[tokio::test]
async fn initialized_pool_loads_txg_zero() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();

    let best = tp.pool.uberblock_load(tp.pool.root()).await.unwrap();
    assert_eq!(best.txg, 0);
}

#[tokio::test]
async fn equal_txg_breaks_tie_on_timestamp() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();

    let (vd, dev) = &tp.disks[0];
    let psize = vd.psize();
    plant(dev, psize, 0, 5, &ub(5, 1000)).await;
    plant(dev, psize, 1, 5, &ub(5, 2000)).await;

    let best = tp.pool.uberblock_load(tp.pool.root()).await.unwrap();
    assert_eq!((best.txg, best.timestamp), (5, 2000));
}

#[tokio::test]
async fn loader_takes_lexicographic_maximum() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();

    let (a, a_dev) = &tp.disks[0];
    let (b, b_dev) = &tp.disks[1];

    plant(a_dev, a.psize(), 0, 3, &ub(3, 50)).await;
    plant(a_dev, a.psize(), 2, 9, &ub(9, 10)).await;
    plant(b_dev, b.psize(), 1, 9, &ub(9, 99)).await;
    plant(b_dev, b.psize(), 3, 4, &ub(4, 12345)).await;

    let best = tp.pool.uberblock_load(tp.pool.root()).await.unwrap();
    assert_eq!((best.txg, best.timestamp), (9, 99));
}

#[tokio::test]
async fn corrupt_and_alien_cells_are_not_candidates() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();

    let (vd, dev) = &tp.disks[0];
    let psize = vd.psize();

    // highest txg, but the cell is torn
    let good = ub(50, 1).to_cell().unwrap();
    let mut torn = good.as_slice().to_vec();
    torn[21] ^= 0x10;
    dev.write_at(
        label_offset(psize, 0, UBERBLOCK_RING_OFFSET + 50 * UBERBLOCK_SIZE),
        &torn,
    )
    .await
    .unwrap();

    // next highest, but stamped with a magic nobody knows
    let mut alien = ub(40, 1);
    alien.magic = 0x1bad_cafe;
    plant(dev, psize, 1, 40, &alien).await;

    // the survivor
    plant(dev, psize, 2, 7, &ub(7, 7)).await;

    let best = tp.pool.uberblock_load(tp.pool.root()).await.unwrap();
    assert_eq!(best.txg, 7);
}

#[tokio::test]
async fn dead_leaf_is_not_scanned() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();

    let (a, a_dev) = &tp.disks[0];
    plant(a_dev, a.psize(), 0, 9, &ub(9, 9)).await;
    a.set_faulted(true);

    // the winning uberblock only exists on the dead leaf
    let best = tp.pool.uberblock_load(tp.pool.root()).await.unwrap();
    assert_eq!(best.txg, 0);
}
