//! Label geometry, the on-disk label regions and the low-level slot
//! I/O, plus the label reader and the in-use probe.
//!
//! Every leaf carries four label slots of [`LABEL_SIZE`] bytes: slots 0
//! and 1 at the front of the device, slots 2 and 3 at the end. A label
//! therefore survives both prefix damage (a rewritten partition table)
//! and suffix damage (a shrunk device). Within a slot:
//!
//! ```text
//! offset    size     region
//! 0         8 KiB    legacy partition padding, ignored
//! 8 KiB     8 KiB    boot header
//! 16 KiB    112 KiB  vdev phys (packed property tree)
//! 128 KiB   128 KiB  uberblock ring, 128 cells of 1 KiB
//! ```
//!
//! Each region ends in a [`ChecksumTail`]: a magic word and a CRC-32
//! over the payload in front of it. Writers seal a region before
//! handing it to [`write_slot`]; readers decide per use whether a
//! checksum failure is an error (config reads) or just "not a valid
//! cell" (speculative uberblock scans).

use std::{io::Cursor, sync::Arc};

use bincode::{deserialize_from, serialize_into};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{
    core::{CoreError, DmaBuf, DmaError},
    nvlist::{keys, NvList},
    pool::{PoolContext, PoolState},
    vdev::Vdev,
};

/// Size of one label slot.
pub const LABEL_SIZE: u64 = 256 * 1024;
/// Label slots per leaf.
pub const LABELS: usize = 4;

/// Legacy partition-table padding at the front of a slot.
pub const LABEL_PAD_SIZE: u64 = 8 * 1024;
pub const BOOT_HEADER_OFFSET: u64 = LABEL_PAD_SIZE;
pub const BOOT_HEADER_SIZE: u64 = 8 * 1024;
pub const PHYS_OFFSET: u64 = BOOT_HEADER_OFFSET + BOOT_HEADER_SIZE;
pub const PHYS_SIZE: u64 = 112 * 1024;
pub const UBERBLOCK_RING_OFFSET: u64 = PHYS_OFFSET + PHYS_SIZE;
pub const UBERBLOCK_RING_SIZE: u64 = LABEL_SIZE - UBERBLOCK_RING_OFFSET;

pub const UBERBLOCK_SHIFT: u64 = 10;
pub const UBERBLOCK_SIZE: u64 = 1 << UBERBLOCK_SHIFT;
/// Uberblock cells per slot; a power of two, so the active cell for
/// txg `t` is `t % UBERBLOCK_COUNT`.
pub const UBERBLOCK_COUNT: u64 = UBERBLOCK_RING_SIZE >> UBERBLOCK_SHIFT;

pub const CHECKSUM_TAIL_SIZE: u64 = 16;
/// Largest packed property tree that fits the phys region.
pub const PHYS_MAX_PACKED: usize = (PHYS_SIZE - CHECKSUM_TAIL_SIZE) as usize;

pub const BOOT_MAGIC: u64 = 0xb007_b10c;
pub const BOOT_VERSION: u64 = 1;
/// The boot area sits between the front labels and the allocatable
/// space.
pub const BOOT_AREA_OFFSET: u64 = 2 * LABEL_SIZE;
pub const BOOT_AREA_SIZE: u64 = 7 << 19;

const TAIL_MAGIC: u64 = 0x0210_da7a_b10c_7a11;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum LabelError {
    #[snafu(display("I/O error on {}: {}", name, source))]
    Io { name: String, source: CoreError },
    #[snafu(display("{} is in use", name))]
    Busy { name: String },
    #[snafu(display("label config for {} does not fit the phys region", name))]
    NameTooLong { name: String },
    #[snafu(display("invalid label config for {}", name))]
    InvalidArgument { name: String },
    #[snafu(display("no usable device under {}", name))]
    NoDevice { name: String },
    #[snafu(display("checksum failure on {} label {}", name, label))]
    ChecksumMismatch { name: String, label: usize },
    #[snafu(display("failed to allocate buffer for {}: {}", name, source))]
    Alloc { name: String, source: DmaError },
    #[snafu(display("serialization error for {}: {}", name, source))]
    SerializeError { name: String, source: bincode::Error },
}

/// Why a label is being initialized; decides both the in-use rules and
/// the payload that gets written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LabelInitReason {
    Create,
    Replace,
    Spare,
    Remove,
}

/// Byte offset of `offset` within slot `l` on a device of `psize`
/// bytes. `psize` must be a whole multiple of [`LABEL_SIZE`]; anything
/// else is a programmer error.
pub fn label_offset(psize: u64, l: usize, offset: u64) -> u64 {
    debug_assert_eq!(psize % LABEL_SIZE, 0);
    debug_assert!(l < LABELS);
    debug_assert!(offset < LABEL_SIZE);
    offset
        + (l as u64) * LABEL_SIZE
        + if l < LABELS / 2 {
            0
        } else {
            psize - (LABELS as u64) * LABEL_SIZE
        }
}

/// The trailer every label region carries: a magic word and a widened
/// CRC-32 of the payload in front of the trailer.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
pub(crate) struct ChecksumTail {
    magic: u64,
    checksum: u64,
}

impl ChecksumTail {
    fn of(payload: &[u8]) -> u64 {
        use crc::crc32;
        u64::from(crc32::checksum_ieee(payload))
    }

    /// Seal a region: compute the payload checksum and serialize the
    /// trailer into the last [`CHECKSUM_TAIL_SIZE`] bytes.
    pub(crate) fn seal(buf: &mut [u8]) {
        let split = buf.len() - CHECKSUM_TAIL_SIZE as usize;
        let tail = ChecksumTail {
            magic: TAIL_MAGIC,
            checksum: ChecksumTail::of(&buf[.. split]),
        };
        let mut cur = Cursor::new(&mut buf[split ..]);
        serialize_into(&mut cur, &tail).unwrap();
    }

    pub(crate) fn verify(buf: &[u8]) -> bool {
        if buf.len() < CHECKSUM_TAIL_SIZE as usize {
            return false;
        }
        let split = buf.len() - CHECKSUM_TAIL_SIZE as usize;
        let tail: ChecksumTail =
            match deserialize_from(&mut Cursor::new(&buf[split ..])) {
                Ok(tail) => tail,
                Err(_) => return false,
            };
        tail.magic == TAIL_MAGIC
            && tail.checksum == ChecksumTail::of(&buf[.. split])
    }
}

/// Boot header stamped into every fresh label.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
pub struct BootHeader {
    pub magic: u64,
    pub version: u64,
    pub offset: u64,
    pub size: u64,
}

impl Default for BootHeader {
    fn default() -> Self {
        BootHeader {
            magic: BOOT_MAGIC,
            version: BOOT_VERSION,
            offset: BOOT_AREA_OFFSET,
            size: BOOT_AREA_SIZE,
        }
    }
}

impl BootHeader {
    pub fn from_slice(slice: &[u8]) -> Option<BootHeader> {
        let header: BootHeader =
            deserialize_from(&mut Cursor::new(slice)).ok()?;
        if header.magic != BOOT_MAGIC || header.version != BOOT_VERSION {
            return None;
        }
        Some(header)
    }

    /// Serialize into a sealed boot header region.
    pub(crate) fn to_region(&self) -> Result<DmaBuf, LabelError> {
        let mut buf = match DmaBuf::new(BOOT_HEADER_SIZE, 0) {
            Ok(buf) => buf,
            Err(source) => {
                return Err(LabelError::Alloc {
                    name: String::from("boot header"),
                    source,
                })
            }
        };
        serialize_into(&mut Cursor::new(buf.as_mut_slice()), self).map_err(
            |source| LabelError::SerializeError {
                name: String::from("boot header"),
                source,
            },
        )?;
        ChecksumTail::seal(buf.as_mut_slice());
        Ok(buf)
    }
}

/// Write a sealed region buffer to slot `l` of a leaf. Failures come
/// back to the caller and are never escalated to pool state; the sync
/// orchestrator turns them into `good_writes` accounting instead.
pub(crate) async fn write_slot(
    vd: &Arc<Vdev>,
    l: usize,
    offset: u64,
    buf: &DmaBuf,
) -> Result<(), LabelError> {
    let device = vd.device().ok_or_else(|| LabelError::Io {
        name: vd.name(),
        source: CoreError::DeviceUnavailable {
            name: vd.name(),
        },
    })?;
    let off = label_offset(vd.psize(), l, offset);
    match device.write_at(off, buf.as_slice()).await {
        Ok(n) => {
            vd.account_write(n);
            Ok(())
        }
        Err(source) => {
            vd.account_write_error();
            Err(LabelError::Io {
                name: vd.name(),
                source,
            })
        }
    }
}

/// Read a region of slot `l` of a leaf into `buf`. No checksum
/// verification happens here; the caller decides what an invalid
/// region means.
pub(crate) async fn read_slot(
    vd: &Arc<Vdev>,
    l: usize,
    offset: u64,
    buf: &mut DmaBuf,
) -> Result<(), LabelError> {
    let device = vd.device().ok_or_else(|| LabelError::Io {
        name: vd.name(),
        source: CoreError::DeviceUnavailable {
            name: vd.name(),
        },
    })?;
    let off = label_offset(vd.psize(), l, offset);
    match device.read_at(off, buf.as_mut_slice()).await {
        Ok(n) => {
            vd.account_read(n);
            Ok(())
        }
        Err(source) => {
            vd.account_read_error();
            Err(LabelError::Io {
                name: vd.name(),
                source,
            })
        }
    }
}

/// Read and validate the label config in one specific slot: checksum
/// tail first, then unpack. `None` for anything that does not hold a
/// well-formed label.
pub async fn read_config_slot(vd: &Arc<Vdev>, l: usize) -> Option<NvList> {
    if !vd.readable() || vd.psize() < (LABELS as u64) * LABEL_SIZE {
        return None;
    }
    let mut buf = DmaBuf::new(PHYS_SIZE, 0).ok()?;
    read_slot(vd, l, PHYS_OFFSET, &mut buf).await.ok()?;
    if !ChecksumTail::verify(buf.as_slice()) {
        vd.account_checksum_error();
        return None;
    }
    match NvList::unpack(&buf.as_slice()[.. PHYS_MAX_PACKED]) {
        Ok(config) => Some(config),
        Err(error) => {
            debug!("{}: label {} does not unpack: {}", vd.name(), l, error);
            None
        }
    }
}

/// Read the first label of a leaf that seals and unpacks correctly.
/// Slots are tried in order; a leaf with no valid label yields `None`,
/// never an error.
pub(crate) async fn read_label_config(vd: &Arc<Vdev>) -> Option<NvList> {
    for l in 0 .. LABELS {
        if let Some(config) = read_config_slot(vd, l).await {
            return Some(config);
        }
    }
    None
}

impl PoolContext {
    /// Read the configuration stored in a leaf's label, trying all four
    /// slots in order. Takes the configuration lock in reader mode.
    pub async fn read_config(&self, vd: &Arc<Vdev>) -> Option<NvList> {
        let _lock = self.config_lock.read().await;
        read_label_config(vd).await
    }

    /// Decide whether a candidate leaf is already in use, by this pool,
    /// another pool, or the spare registry. Returns the busy verdict
    /// and, when the device GUID is a registered spare, that GUID so
    /// the caller can adopt it.
    pub async fn inuse(
        &self,
        vd: &Arc<Vdev>,
        crtxg: u64,
        reason: LabelInitReason,
    ) -> (bool, Option<u64>) {
        let label = match read_label_config(vd).await {
            Some(label) => label,
            None => return (false, None),
        };

        let state = label.get_u64(keys::POOL_STATE);
        let device_guid = label.get_u64(keys::GUID);
        let (state, device_guid) = match (state, device_guid) {
            (Some(s), Some(g)) => (s, g),
            _ => return (false, None),
        };
        let spare_label = state == PoolState::Spare.as_u64();

        let mut pool_guid = 0;
        let mut pool_txg = 0;
        if !spare_label {
            match (
                label.get_u64(keys::POOL_GUID),
                label.get_u64(keys::POOL_TXG),
            ) {
                (Some(pg), Some(pt)) => {
                    pool_guid = pg;
                    pool_txg = pt;
                }
                _ => return (false, None),
            }
        }

        // a label naming a pool this host has never heard of, for a
        // device that is not a registered spare, is stale
        if !spare_label
            && !self.pools().exists(pool_guid)
            && !self.spares().exists(device_guid)
        {
            return (false, None);
        }

        // a zero pool txg means the label was initialized but the
        // device never joined an active pool; it is only in use if it
        // was stamped in the very transaction we are running now
        let vdtxg = label.get_u64(keys::CREATE_TXG).unwrap_or(0);
        if !spare_label && pool_txg == 0 && vdtxg == crtxg {
            return (true, None);
        }

        if self.spares().exists(device_guid) {
            let busy = match reason {
                LabelInitReason::Create => true,
                LabelInitReason::Replace => {
                    !(self.spares().registered_in(device_guid, self.guid)
                        && self.spares().active_pool(device_guid).is_none())
                }
                LabelInitReason::Spare => {
                    self.spares().registered_in(device_guid, self.guid)
                }
                LabelInitReason::Remove => false,
            };
            return (busy, Some(device_guid));
        }

        (state == PoolState::Active.as_u64(), None)
    }
}
