//! RAM-backed block device. Storage is a sparse extent map, so a device
//! can present many gigabytes while only the touched regions take
//! memory. Used by the test suites; also handy as a reference for what a
//! backend must provide.
//!
//! A [`WriteGate`] shared between devices models a power cut: once the
//! gate runs out of admissions, every subsequent write on every device
//! holding it fails, while the data already written stays readable. This
//! is what the crash-consistency tests use to stop a sync at an
//! arbitrary write boundary.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::core::{BlockDevice, BlockDeviceIoStats, CoreError};

/// Admission counter for writes. `unlimited` never refuses; `after(n)`
/// admits exactly `n` writes and then refuses everything.
pub struct WriteGate {
    remaining: AtomicI64,
}

impl WriteGate {
    pub fn unlimited() -> Arc<WriteGate> {
        Arc::new(WriteGate {
            remaining: AtomicI64::new(i64::MAX),
        })
    }

    pub fn after(n: u64) -> Arc<WriteGate> {
        Arc::new(WriteGate {
            remaining: AtomicI64::new(n as i64),
        })
    }

    fn admit(&self) -> bool {
        loop {
            let cur = self.remaining.load(Ordering::SeqCst);
            if cur <= 0 {
                return false;
            }
            if self
                .remaining
                .compare_exchange(
                    cur,
                    cur - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) <= 0
    }
}

pub struct MemDevice {
    name: String,
    size: u64,
    block_len: u64,
    extents: Mutex<BTreeMap<u64, Vec<u8>>>,
    online: AtomicBool,
    gate: RwLock<Arc<WriteGate>>,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl MemDevice {
    pub fn new(name: &str, size: u64) -> Arc<MemDevice> {
        Arc::new(MemDevice {
            name: name.to_string(),
            size,
            block_len: 512,
            extents: Mutex::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            gate: RwLock::new(WriteGate::unlimited()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_gate(&self, gate: Arc<WriteGate>) {
        *self.gate.write() = gate;
    }

    fn read_extents(&self, offset: u64, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = 0;
        }
        let end = offset + buf.len() as u64;
        let map = self.extents.lock();
        for (&start, data) in map.range(.. end) {
            let extent_end = start + data.len() as u64;
            if extent_end <= offset {
                continue;
            }
            let copy_start = start.max(offset);
            let copy_end = extent_end.min(end);
            buf[(copy_start - offset) as usize .. (copy_end - offset) as usize]
                .copy_from_slice(
                    &data[(copy_start - start) as usize
                        .. (copy_end - start) as usize],
                );
        }
    }

    fn write_extent(&self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut map = self.extents.lock();
        // split or drop extents the new write overlaps
        let overlapping: Vec<u64> = map
            .range(.. end)
            .filter(|(&start, v)| start + v.len() as u64 > offset)
            .map(|(&start, _)| start)
            .collect();
        for start in overlapping {
            let v = map.remove(&start).unwrap();
            let extent_end = start + v.len() as u64;
            if start < offset {
                map.insert(start, v[.. (offset - start) as usize].to_vec());
            }
            if extent_end > end {
                map.insert(end, v[(end - start) as usize ..].to_vec());
            }
        }
        map.insert(offset, data.to_vec());
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn size_in_bytes(&self) -> u64 {
        self.size
    }

    fn block_len(&self) -> u64 {
        self.block_len
    }

    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn alignment(&self) -> u64 {
        9
    }

    fn io_stats(&self) -> BlockDeviceIoStats {
        BlockDeviceIoStats {
            num_read_ops: self.reads.load(Ordering::Relaxed),
            num_write_ops: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    async fn read_at(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<u64, CoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CoreError::DeviceUnavailable {
                name: self.name.clone(),
            });
        }
        if offset + buf.len() as u64 > self.size {
            return Err(CoreError::InvalidOffset {
                name: self.name.clone(),
                offset,
                len: buf.len() as u64,
            });
        }
        self.read_extents(offset, buf);
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len() as u64)
    }

    async fn write_at(
        &self,
        offset: u64,
        buf: &[u8],
    ) -> Result<u64, CoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CoreError::DeviceUnavailable {
                name: self.name.clone(),
            });
        }
        if offset + buf.len() as u64 > self.size {
            return Err(CoreError::InvalidOffset {
                name: self.name.clone(),
                offset,
                len: buf.len() as u64,
            });
        }
        if !self.gate.read().admit() {
            return Err(CoreError::WriteFailed {
                name: self.name.clone(),
                offset,
                len: buf.len() as u64,
            });
        }
        self.write_extent(offset, buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len() as u64)
    }

    async fn flush(&self) -> Result<(), CoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CoreError::FlushFailed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}
