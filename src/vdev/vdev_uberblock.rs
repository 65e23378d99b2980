//! The uberblock, the pool's root record, and the import-time scan that
//! elects the best one.
//!
//! Every label slot embeds a ring of 128 uberblock cells; the active
//! cell for a txg is `txg % 128`, so the previous root is never
//! overwritten by the next one. After a split-brain episode two leaves
//! can hold different uberblocks with the same txg, which is why the
//! ordering tie-breaks on the wall-clock timestamp: the one written
//! later was the one actually in service.

use std::{
    cmp::Ordering as CmpOrdering,
    io::Cursor,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bincode::{deserialize_from, serialize_into};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    core::DmaBuf,
    pool::{PoolContext, VERSION_CURRENT, VERSION_INITIAL},
    vdev::{
        vdev_label::{
            read_slot,
            ChecksumTail,
            LabelError,
            LABELS,
            UBERBLOCK_COUNT,
            UBERBLOCK_RING_OFFSET,
            UBERBLOCK_SIZE,
        },
        Vdev,
    },
};

pub const UBERBLOCK_MAGIC: u64 = 0x00ba_b10c;

/// Pointer to the root of the meta-object set. The label subsystem
/// treats it as opaque apart from the birth txg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPtr {
    pub vdev: u64,
    pub offset: u64,
    pub birth_txg: u64,
    pub fill: u64,
    pub checksum: [u64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Uberblock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
}

impl Uberblock {
    pub fn new(version: u64) -> Uberblock {
        Uberblock {
            magic: UBERBLOCK_MAGIC,
            version,
            txg: 0,
            guid_sum: 0,
            timestamp: 0,
            rootbp: BlockPtr::default(),
        }
    }

    /// Refresh this uberblock for `txg`. Returns whether the root block
    /// pointer was born in `txg`, i.e. whether anything beyond the
    /// bookkeeping fields actually changed.
    pub(crate) fn update(
        &mut self,
        root: &Arc<Vdev>,
        txg: u64,
        version: u64,
    ) -> bool {
        self.magic = UBERBLOCK_MAGIC;
        self.version = version;
        self.txg = txg;
        self.guid_sum = root.guid_sum();
        self.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.rootbp.birth_txg == txg
    }

    /// Lexicographic order on `(txg, timestamp)`.
    pub fn compare(&self, other: &Uberblock) -> CmpOrdering {
        (self.txg, self.timestamp).cmp(&(other.txg, other.timestamp))
    }

    /// Serialize into a sealed ring cell.
    pub fn to_cell(&self) -> Result<DmaBuf, LabelError> {
        let mut buf = match DmaBuf::new(UBERBLOCK_SIZE, 0) {
            Ok(buf) => buf,
            Err(source) => {
                return Err(LabelError::Alloc {
                    name: String::from("uberblock"),
                    source,
                })
            }
        };
        serialize_into(&mut Cursor::new(buf.as_mut_slice()), self).map_err(
            |source| LabelError::SerializeError {
                name: String::from("uberblock"),
                source,
            },
        )?;
        ChecksumTail::seal(buf.as_mut_slice());
        Ok(buf)
    }

    /// Deserialize and verify a ring cell: checksum tail, magic and a
    /// version this software understands. A zero txg is valid; freshly
    /// initialized leaves carry one in every cell.
    pub fn from_cell(slice: &[u8]) -> Option<Uberblock> {
        if !ChecksumTail::verify(slice) {
            return None;
        }
        let ub: Uberblock =
            deserialize_from(&mut Cursor::new(slice)).ok()?;
        if ub.magic != UBERBLOCK_MAGIC {
            return None;
        }
        if ub.version < VERSION_INITIAL || ub.version > VERSION_CURRENT {
            return None;
        }
        Some(ub)
    }
}

async fn load_cell(
    vd: &Arc<Vdev>,
    l: usize,
    n: u64,
    best: &Mutex<Option<Uberblock>>,
) {
    let mut buf = match DmaBuf::new(UBERBLOCK_SIZE, 0) {
        Ok(buf) => buf,
        Err(_) => return,
    };
    let offset = UBERBLOCK_RING_OFFSET + n * UBERBLOCK_SIZE;
    if read_slot(vd, l, offset, &mut buf).await.is_err() {
        return;
    }
    // speculative read; an unreadable or blank cell is simply not a
    // candidate
    if let Some(candidate) = Uberblock::from_cell(buf.as_slice()) {
        let mut guard = best.lock();
        let replace = match guard.as_ref() {
            None => true,
            Some(current) => {
                candidate.compare(current) == CmpOrdering::Greater
            }
        };
        if replace {
            *guard = Some(candidate);
        }
    }
}

impl PoolContext {
    /// Scan every uberblock cell of every slot of every readable leaf
    /// under `root` and return the best verified uberblock, if any.
    /// Takes the configuration lock in reader mode.
    pub async fn uberblock_load(&self, root: &Arc<Vdev>) -> Option<Uberblock> {
        let _lock = self.config_lock.read().await;

        let best: Mutex<Option<Uberblock>> = Mutex::new(None);
        let leaves = root.leaves();
        let mut futures = Vec::new();
        for leaf in &leaves {
            if !leaf.readable() {
                continue;
            }
            for l in 0 .. LABELS {
                for n in 0 .. UBERBLOCK_COUNT {
                    futures.push(load_cell(leaf, l, n, &best));
                }
            }
        }
        join_all(futures).await;

        let result = best.into_inner();
        match &result {
            Some(ub) => debug!(
                "{}: best uberblock txg {} timestamp {}",
                root.name(),
                ub.txg,
                ub.timestamp
            ),
            None => info!("{}: no valid uberblock found", root.name()),
        }
        result
    }
}
