//! The crash-consistent writer: commits a new pool root by rewriting
//! labels and uberblocks in a fixed phase order with cache-flush
//! barriers between phases.
//!
//! The order is the design. Even label slots are rewritten first; if
//! power fails here, the old uberblock is still the best on disk and
//! the half-written even labels carry a txg from its future, so an
//! importer discards them and trusts the odd slots. Only after the
//! even labels and all data of the txg are flushed does the new
//! uberblock go out, one ring cell per slot. Once that is flushed the
//! new root is durable and the odd slots are allowed to catch up.
//! Re-running any prefix of the sequence is harmless, which is what
//! makes a failed sync safe to retry.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::future::join_all;
use parking_lot::Mutex;

use crate::{
    core::DmaBuf,
    nvlist::NvError,
    pool::PoolContext,
    vdev::{
        vdev_config::pool_config,
        vdev_label::{
            write_slot,
            ChecksumTail,
            LabelError,
            LABELS,
            PHYS_MAX_PACKED,
            PHYS_OFFSET,
            PHYS_SIZE,
            UBERBLOCK_COUNT,
            UBERBLOCK_RING_OFFSET,
            UBERBLOCK_SIZE,
        },
        vdev_uberblock::Uberblock,
        Vdev,
    },
};

/// Even label slots, written before the new uberblock.
const EVEN_SLOTS: [usize; 2] = [0, 2];
/// Odd label slots, written after the new uberblock is durable.
const ODD_SLOTS: [usize; 2] = [1, 3];

/// Build the sealed phys region for one leaf at `txg`.
fn label_phys_block(
    pool: &PoolContext,
    vd: &Arc<Vdev>,
    txg: u64,
) -> Result<DmaBuf, LabelError> {
    let config = pool_config(pool, vd, txg)?;
    let packed = config.pack(PHYS_MAX_PACKED).map_err(|error| match error {
        NvError::TooSmall {
            ..
        } => LabelError::NameTooLong {
            name: vd.name(),
        },
        _ => LabelError::InvalidArgument {
            name: vd.name(),
        },
    })?;
    let mut buf = match DmaBuf::new(PHYS_SIZE, 0) {
        Ok(buf) => buf,
        Err(source) => {
            return Err(LabelError::Alloc {
                name: vd.name(),
                source,
            })
        }
    };
    buf.as_mut_slice()[.. packed.len()].copy_from_slice(&packed);
    ChecksumTail::seal(buf.as_mut_slice());
    Ok(buf)
}

async fn label_sync_write(
    vd: &Arc<Vdev>,
    l: usize,
    buf: &DmaBuf,
    good_writes: &AtomicU64,
    last_error: &Mutex<Option<LabelError>>,
) {
    match write_slot(vd, l, PHYS_OFFSET, buf).await {
        Ok(()) => {
            good_writes.fetch_add(1, Ordering::SeqCst);
        }
        Err(error) => {
            debug!("{}: label {} write failed: {}", vd.name(), l, error);
            *last_error.lock() = Some(error);
        }
    }
}

async fn uberblock_write(
    vd: &Arc<Vdev>,
    l: usize,
    offset: u64,
    cell: &DmaBuf,
    good_writes: &AtomicU64,
) {
    match write_slot(vd, l, offset, cell).await {
        Ok(()) => {
            // a write only earns credit when the leaf's top-level is
            // visible to the allocator; a brand-new top-level whose
            // metaslab array is still zero does not count
            if vd.top().ms_array() != 0 {
                good_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Err(error) => {
            debug!("{}: uberblock write failed: {}", vd.name(), error);
        }
    }
}

/// Write the new uberblock to its ring cell in every slot of every
/// writable leaf under `vds`. Returns the credited write count.
async fn uberblock_sync_list(
    vds: &[Arc<Vdev>],
    ub: &Uberblock,
    txg: u64,
) -> Result<u64, LabelError> {
    let cell = ub.to_cell()?;
    let offset = UBERBLOCK_RING_OFFSET
        + (txg % UBERBLOCK_COUNT) * UBERBLOCK_SIZE;
    let good_writes = AtomicU64::new(0);

    let mut leaves = Vec::new();
    for vd in vds {
        for leaf in vd.leaves() {
            if leaf.writeable() {
                leaves.push(leaf);
            }
        }
    }

    let mut writes = Vec::new();
    for leaf in &leaves {
        for l in 0 .. LABELS {
            writes.push(uberblock_write(leaf, l, offset, &cell, &good_writes));
        }
    }
    join_all(writes).await;

    Ok(good_writes.load(Ordering::SeqCst))
}

/// Flush the write caches of all writable leaves under `vds`. Flush
/// failures are logged and ignored; a device that cannot flush will
/// also fail its next write, which is where the error accounting
/// lives.
async fn flush_vdevs(vds: &[Arc<Vdev>]) {
    let mut leaves = Vec::new();
    for vd in vds {
        for leaf in vd.leaves() {
            if leaf.writeable() {
                leaves.push(leaf);
            }
        }
    }
    let mut flushes = Vec::new();
    for leaf in &leaves {
        flushes.push(flush_one(leaf));
    }
    join_all(flushes).await;
}

async fn flush_one(vd: &Arc<Vdev>) {
    if let Some(device) = vd.device() {
        if let Err(error) = device.flush().await {
            debug!("{}: cache flush failed: {}", vd.name(), error);
        }
    }
}

impl PoolContext {
    /// Rewrite the phys region of the given slots for every writable
    /// leaf under every dirty top-level.
    async fn label_sync_list(
        &self,
        slots: &[usize],
        txg: u64,
    ) -> (u64, Option<LabelError>) {
        let good_writes = AtomicU64::new(0);
        let last_error: Mutex<Option<LabelError>> = Mutex::new(None);

        let mut blocks = Vec::new();
        for top in self.dirty_list() {
            for leaf in top.leaves() {
                if !leaf.writeable() {
                    continue;
                }
                match label_phys_block(self, &leaf, txg) {
                    Ok(buf) => blocks.push((leaf, buf)),
                    Err(error) => {
                        *last_error.lock() = Some(error);
                    }
                }
            }
        }

        let mut writes = Vec::new();
        for (leaf, buf) in &blocks {
            for l in slots {
                writes.push(label_sync_write(
                    leaf,
                    *l,
                    buf,
                    &good_writes,
                    &last_error,
                ));
            }
        }
        join_all(writes).await;

        (good_writes.load(Ordering::SeqCst), last_error.into_inner())
    }

    /// Commit a consistent pool root for `txg` across the given synced
    /// top-level vdevs. On failure the pool is left at its previous
    /// consistent state; re-invoking with the same arguments redoes
    /// every phase and is indistinguishable on disk from a single
    /// successful run.
    ///
    /// Takes the configuration lock in writer mode.
    pub async fn config_sync(
        &self,
        svd: &[Arc<Vdev>],
        txg: u64,
    ) -> Result<(), LabelError> {
        let _lock = self.config_lock.write().await;
        let root = self.root().clone();

        // nothing-to-do fast path: the uberblock is refreshed for the
        // new txg, and if that changed nothing material and no vdev
        // configuration is dirty, the previous root still stands
        {
            let mut ub = self.ub_lock().write();
            assert!(ub.txg <= txg, "uberblock txg ahead of sync txg");
            if ub.txg < txg {
                let changed = ub.update(&root, txg, self.version);
                if !changed && self.dirty_is_empty() {
                    return Ok(());
                }
            }
        }
        if txg > self.freeze_txg() {
            debug!("{}: txg {} beyond freeze point, skipped", self.name, txg);
            return Ok(());
        }
        let ub = self.uberblock();

        // Phase 0: barrier. Everything the txg wrote must be on stable
        // media before an uberblock can reference it.
        let written = self.take_written();
        flush_vdevs(&written).await;

        // Phase 1: even labels.
        let mut retried = false;
        loop {
            let (good_writes, last_error) =
                self.label_sync_list(&EVEN_SLOTS, txg).await;
            if good_writes > 0 {
                break;
            }
            if !retried {
                retried = true;
                warn!(
                    "{}: no even label made it out for txg {}, \
                     retrying with the whole tree",
                    self.name, txg
                );
                self.dirty_all();
                continue;
            }
            return Err(last_error.unwrap_or(LabelError::NoDevice {
                name: root.name(),
            }));
        }

        // Phase 2: barrier.
        flush_vdevs(&self.dirty_list()).await;

        // Phase 3: the uberblock itself.
        let mut good_writes = uberblock_sync_list(svd, &ub, txg).await?;
        if good_writes == 0 && !is_root_list(svd, &root) {
            good_writes =
                uberblock_sync_list(&[root.clone()], &ub, txg).await?;
        }
        if good_writes == 0 {
            return Err(LabelError::NoDevice {
                name: root.name(),
            });
        }

        // Phase 4: barrier, synced top-levels only.
        flush_vdevs(svd).await;

        // Phase 5: odd labels.
        let (good_writes, last_error) =
            self.label_sync_list(&ODD_SLOTS, txg).await;
        if good_writes == 0 {
            let dirty = self.dirty_list();
            let log_only =
                !dirty.is_empty() && dirty.iter().all(|vd| vd.is_log());
            if !log_only {
                return Err(last_error.unwrap_or(LabelError::NoDevice {
                    name: root.name(),
                }));
            }
            // log devices are opportunistic; losing their odd labels
            // does not invalidate the root we just committed
            info!(
                "{}: odd label failure limited to log vdevs in txg {}",
                self.name, txg
            );
        }

        // Phase 6: barrier.
        flush_vdevs(&self.dirty_list()).await;

        self.config_clean();
        Ok(())
    }
}

fn is_root_list(svd: &[Arc<Vdev>], root: &Arc<Vdev>) -> bool {
    svd.len() == 1 && Arc::ptr_eq(&svd[0], root)
}
