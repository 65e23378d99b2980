//! The sync orchestrator: phase ordering, dead leaves, idempotence and
//! crash consistency under an arbitrary power cut.

use assert_matches::assert_matches;

use poolstor::{
    core::{MemDevice, WriteGate},
    nvlist::keys,
    vdev::{
        vdev_label::{
            read_config_slot,
            LabelError,
            LabelInitReason,
            LABELS,
            UBERBLOCK_COUNT,
        },
        vdev_uberblock::Uberblock,
        Vdev,
    },
};

mod common;
use common::{
    disk_over,
    mirror_pool,
    mirror_pool_over,
    read_cell,
    read_label,
    Host,
    TestPool,
    SMALL_DISK,
};

/// Fresh initialized mirror pool, dirtied and ready to sync.
async fn ready_pool(host: &Host, leaf_guids: &[u64]) -> TestPool {
    let tp = mirror_pool(host, "tank", 7000, 300, leaf_guids, SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();
    tp.pool.config_dirty(&tp.top);
    tp.pool.note_written(&tp.top);
    tp
}

#[tokio::test]
async fn sync_writes_labels_and_uberblock() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;

    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    for (vd, dev) in &tp.disks {
        // the public reader takes the first valid slot
        let config = tp.pool.read_config(vd).await.unwrap();
        assert_eq!(config.get_u64(keys::POOL_TXG), Some(7));

        for l in 0 .. LABELS {
            let config = read_config_slot(vd, l).await.unwrap();
            assert_eq!(config.get_u64(keys::POOL_TXG), Some(7));
        }
        for l in 0 .. LABELS {
            let cell =
                read_cell(dev, vd.psize(), l, 7 % UBERBLOCK_COUNT).await;
            let ub = Uberblock::from_cell(&cell).unwrap();
            assert_eq!(ub.txg, 7);
            assert_eq!(ub.guid_sum, tp.pool.root().guid_sum());
        }
    }
    assert_eq!(tp.pool.uberblock().txg, 7);
}

#[tokio::test]
async fn sync_survives_a_dead_leaf() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;

    // kill B
    tp.disks[1].0.set_faulted(true);

    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    // A carries the new labels and the new uberblock
    let (a, a_dev) = &tp.disks[0];
    for l in 0 .. LABELS {
        let config = read_config_slot(a, l).await.unwrap();
        assert_eq!(config.get_u64(keys::POOL_TXG), Some(7));
    }
    let cell = read_cell(a_dev, a.psize(), 0, 7 % UBERBLOCK_COUNT).await;
    assert_eq!(Uberblock::from_cell(&cell).unwrap().txg, 7);

    // B still holds its creation-time labels
    let b_probe = disk_over(200, &tp.disks[1].1);
    for l in 0 .. LABELS {
        let config = read_config_slot(&b_probe, l).await.unwrap();
        assert_eq!(config.get_u64(keys::POOL_TXG), Some(0));
    }
}

#[tokio::test]
async fn sync_fails_with_every_leaf_dead() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;
    tp.disks[0].0.set_faulted(true);
    tp.disks[1].0.set_faulted(true);

    assert_matches!(
        tp.pool.config_sync(&[tp.top.clone()], 7).await,
        Err(LabelError::NoDevice { .. })
    );
}

#[tokio::test]
async fn nothing_to_sync_is_a_fast_success() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();
    // no dirty config, no new root block pointer

    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    // the on-disk state was not touched
    for (vd, _) in &tp.disks {
        let config = read_config_slot(vd, 0).await.unwrap();
        assert_eq!(config.get_u64(keys::POOL_TXG), Some(0));
    }
    // but the in-memory uberblock moved with the txg
    assert_eq!(tp.pool.uberblock().txg, 7);
}

#[tokio::test]
async fn frozen_pool_skips_sync() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;
    tp.pool.freeze(5);

    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    for (vd, _) in &tp.disks {
        let config = read_config_slot(vd, 0).await.unwrap();
        assert_eq!(config.get_u64(keys::POOL_TXG), Some(0));
    }
}

#[tokio::test]
async fn sync_twice_is_idempotent() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;

    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    let mut first = Vec::new();
    for (vd, dev) in &tp.disks {
        for l in 0 .. LABELS {
            first.push(read_label(dev, vd.psize(), l).await);
        }
    }

    // a retry of the same txg redoes every phase
    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();

    let mut second = Vec::new();
    for (vd, dev) in &tp.disks {
        for l in 0 .. LABELS {
            second.push(read_label(dev, vd.psize(), l).await);
        }
    }
    assert_eq!(first, second);
}

#[tokio::test]
async fn uberblock_credit_requires_ms_array() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100, 200], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();
    tp.pool.config_dirty(&tp.top);

    // a top-level the allocator has not initialized yet earns no
    // uberblock write credit, so the sync reports no usable device
    // even though the writes themselves land
    tp.top.set_metaslab(0, 0);
    assert_matches!(
        tp.pool.config_sync(&[tp.top.clone()], 7).await,
        Err(LabelError::NoDevice { .. })
    );

    let (vd, dev) = &tp.disks[0];
    let cell = read_cell(dev, vd.psize(), 0, 7 % UBERBLOCK_COUNT).await;
    assert_eq!(Uberblock::from_cell(&cell).unwrap().txg, 7);
}

#[tokio::test]
async fn odd_label_failure_on_log_only_vdev_is_demoted() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();
    tp.top.set_log(true);
    tp.pool.config_dirty(&tp.top);

    // admit the even labels (2) and the uberblocks (4), then cut power
    // before the odd pass
    tp.disks[0].1.set_gate(WriteGate::after(6));
    tp.pool.config_sync(&[tp.top.clone()], 7).await.unwrap();
}

#[tokio::test]
async fn odd_label_failure_on_data_vdev_is_fatal() {
    let host = Host::new();
    let tp = mirror_pool(&host, "tank", 7000, 300, &[100], SMALL_DISK);
    tp.pool
        .label_init(&tp.top, 1, LabelInitReason::Create)
        .await
        .unwrap();
    tp.pool.config_dirty(&tp.top);

    tp.disks[0].1.set_gate(WriteGate::after(6));
    assert_matches!(
        tp.pool.config_sync(&[tp.top.clone()], 7).await,
        Err(LabelError::Io { .. })
    );
}

#[tokio::test]
async fn crash_before_uberblock_keeps_old_root() {
    let host = Host::new();
    let tp = ready_pool(&host, &[100, 200]).await;

    // even labels are 2 leaves x 2 slots; everything after fails
    let gate = WriteGate::after(4);
    for (_, dev) in &tp.disks {
        dev.set_gate(gate.clone());
    }
    assert!(tp.pool.config_sync(&[tp.top.clone()], 7).await.is_err());

    // power back on
    for (_, dev) in &tp.disks {
        dev.set_gate(WriteGate::unlimited());
    }
    let reopened = reopen(&host, &tp);

    // the old root is still elected
    let best = reopened
        .pool
        .uberblock_load(reopened.pool.root())
        .await
        .unwrap();
    assert_eq!(best.txg, 0);

    // odd labels still describe the old configuration
    for (vd, _) in &reopened.disks {
        for l in &[1, 3] {
            let config = read_config_slot(vd, *l).await.unwrap();
            assert_eq!(config.get_u64(keys::POOL_TXG), Some(0));
        }
        // while the even labels are from the future of the elected
        // root, which is how an importer knows to reject them
        for l in &[0, 2] {
            let config = read_config_slot(vd, *l).await.unwrap();
            assert_eq!(config.get_u64(keys::POOL_TXG), Some(7));
        }
    }
}

/// Rebuild vdevs and pool over the same devices, as an import would.
fn reopen(host: &Host, tp: &TestPool) -> TestPool {
    let disks: Vec<(std::sync::Arc<Vdev>, std::sync::Arc<MemDevice>)> = tp
        .disks
        .iter()
        .map(|(vd, dev)| (disk_over(vd.guid(), dev), dev.clone()))
        .collect();
    mirror_pool_over(host, "tank", 7000, 300, disks)
}

#[tokio::test]
async fn crash_at_any_write_boundary_is_recoverable() {
    // a full sync of this pool issues 16 physical writes: 4 even
    // labels, 8 uberblock cells, 4 odd labels
    for cut_after in 0 ..= 17 {
        let host = Host::new();
        let tp = ready_pool(&host, &[100, 200]).await;

        let gate = WriteGate::after(cut_after);
        for (_, dev) in &tp.disks {
            dev.set_gate(gate.clone());
        }
        let _ = tp.pool.config_sync(&[tp.top.clone()], 7).await;

        for (_, dev) in &tp.disks {
            dev.set_gate(WriteGate::unlimited());
        }
        let reopened = reopen(&host, &tp);

        let best = reopened
            .pool
            .uberblock_load(reopened.pool.root())
            .await
            .expect("some root must always be electable");

        // on every leaf, at least one slot parity decodes entirely to
        // labels no newer than the elected root
        for (vd, _) in &reopened.disks {
            let mut ok = false;
            for parity in &[[0usize, 2], [1, 3]] {
                let mut parity_ok = true;
                for l in parity {
                    match read_config_slot(vd, *l).await {
                        Some(config) => {
                            if config.get_u64(keys::POOL_TXG).unwrap_or(u64::MAX)
                                > best.txg
                            {
                                parity_ok = false;
                            }
                        }
                        None => parity_ok = false,
                    }
                }
                if parity_ok {
                    ok = true;
                }
            }
            assert!(
                ok,
                "no consistent slot parity on {} after cut at {}",
                vd.name(),
                cut_after
            );
        }
    }
}
