//! Stamping fresh labels onto the leaves of a subtree: pool creation,
//! device add, replacement, spare registration and graceful removal all
//! come through here.

use std::sync::Arc;

use futures::future::join_all;

use crate::{
    core::{CoreError, DmaBuf},
    nvlist::{keys, NvError, NvList},
    pool::{PoolContext, PoolState},
    vdev::{
        vdev_config::pool_config,
        vdev_label::{
            write_slot,
            BootHeader,
            ChecksumTail,
            LabelError,
            LabelInitReason,
            BOOT_HEADER_OFFSET,
            LABELS,
            LABEL_SIZE,
            PHYS_MAX_PACKED,
            PHYS_OFFSET,
            PHYS_SIZE,
            UBERBLOCK_COUNT,
            UBERBLOCK_RING_OFFSET,
            UBERBLOCK_SIZE,
        },
        Vdev,
    },
};

impl PoolContext {
    /// Initialize labels on every leaf of `vd`. Fails eagerly on the
    /// first leaf that is dead, busy, or cannot be written; a failed
    /// init leaves no reachable trace (partial label writes do not
    /// seal, so a later probe treats them as absent).
    ///
    /// Takes the configuration lock in writer mode.
    pub async fn label_init(
        &self,
        vd: &Arc<Vdev>,
        crtxg: u64,
        reason: LabelInitReason,
    ) -> Result<(), LabelError> {
        let _lock = self.config_lock.write().await;
        for leaf in vd.leaves() {
            self.label_init_leaf(&leaf, crtxg, reason).await?;
        }
        Ok(())
    }

    async fn label_init_leaf(
        &self,
        vd: &Arc<Vdev>,
        crtxg: u64,
        reason: LabelInitReason,
    ) -> Result<(), LabelError> {
        if vd.is_dead() {
            return Err(LabelError::Io {
                name: vd.name(),
                source: CoreError::DeviceUnavailable {
                    name: vd.name(),
                },
            });
        }
        if vd.psize() < (LABELS as u64) * LABEL_SIZE {
            return Err(LabelError::InvalidArgument {
                name: vd.name(),
            });
        }

        let mut spare_guid = None;
        if reason != LabelInitReason::Remove {
            let (busy, found) = self.inuse(vd, crtxg, reason).await;
            spare_guid = found;
            if busy {
                return Err(LabelError::Busy {
                    name: vd.name(),
                });
            }
        }

        if let Some(guid) = spare_guid {
            // adopt the spare's on-disk GUID so it stays recognizable
            // everywhere, and let the guid_sum delta ripple upward
            info!(
                "{}: adopting spare guid {} (was {})",
                vd.name(),
                guid,
                vd.guid()
            );
            vd.set_guid(guid);
            // the label already stamps the device as a shared spare;
            // nothing to rewrite, but this pool still records it
            if reason == LabelInitReason::Spare {
                self.spare_register(vd, reason);
                return Ok(());
            }
        }

        let label = if reason == LabelInitReason::Spare
            || (reason == LabelInitReason::Remove && vd.is_spare())
        {
            // shared-spare marker: just enough for any pool to
            // recognize the device
            let mut nv = NvList::new();
            nv.add_u64(keys::VERSION, self.version);
            nv.add_u64(keys::POOL_STATE, PoolState::Spare.as_u64());
            nv.add_u64(keys::GUID, vd.guid());
            nv
        } else {
            // full label; the pool txg stays zero until the first sync,
            // and create_txg makes duplicate use within one transaction
            // detectable
            let mut nv = pool_config(self, vd, 0)?;
            nv.add_u64(keys::CREATE_TXG, crtxg);
            nv
        };

        let packed = label.pack(PHYS_MAX_PACKED).map_err(|error| match error {
            NvError::TooSmall {
                ..
            } => LabelError::NameTooLong {
                name: vd.name(),
            },
            _ => LabelError::InvalidArgument {
                name: vd.name(),
            },
        })?;

        let mut phys = match DmaBuf::new(PHYS_SIZE, 0) {
            Ok(buf) => buf,
            Err(source) => {
                return Err(LabelError::Alloc {
                    name: vd.name(),
                    source,
                })
            }
        };
        phys.as_mut_slice()[.. packed.len()].copy_from_slice(&packed);
        ChecksumTail::seal(phys.as_mut_slice());

        let boot = BootHeader::default().to_region()?;

        // uberblock template: the current pool root with its txg forced
        // to zero, marking the device as not yet part of an active pool
        let mut ub = self.uberblock();
        ub.txg = 0;
        let cell = ub.to_cell()?;

        let mut writes = Vec::new();
        for l in 0 .. LABELS {
            writes.push(write_slot(vd, l, PHYS_OFFSET, &phys));
            writes.push(write_slot(vd, l, BOOT_HEADER_OFFSET, &boot));
            for n in 0 .. UBERBLOCK_COUNT {
                writes.push(write_slot(
                    vd,
                    l,
                    UBERBLOCK_RING_OFFSET + n * UBERBLOCK_SIZE,
                    &cell,
                ));
            }
        }
        for result in join_all(writes).await {
            result?;
        }

        info!("{}: labels written ({:?})", vd.name(), reason);

        self.spare_register(vd, reason);

        Ok(())
    }

    /// A leaf that just became a shared spare, or that carries a GUID
    /// some pool already lists as one, goes into the registry under
    /// this pool.
    fn spare_register(&self, vd: &Arc<Vdev>, reason: LabelInitReason) {
        if !vd.is_spare()
            && (reason == LabelInitReason::Spare
                || self.spares().exists(vd.guid()))
        {
            self.spares().add(vd.guid(), self.guid);
            vd.set_is_spare(true);
        }
    }
}
