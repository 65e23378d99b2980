//! Primitives shared by every part of the label subsystem: the device
//! I/O error type, the owned I/O buffer and the block device trait.

use snafu::Snafu;

mod block_device;
mod mem_device;

pub use block_device::{BlockDevice, BlockDeviceIoStats};
pub use mem_device::{MemDevice, WriteGate};

#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility = "pub(crate)")]
pub enum CoreError {
    #[snafu(display("device {} is unavailable", name))]
    DeviceUnavailable { name: String },
    #[snafu(display(
        "offset {} length {} out of range for {}",
        offset,
        len,
        name
    ))]
    InvalidOffset { name: String, offset: u64, len: u64 },
    #[snafu(display(
        "read of {} bytes at offset {} failed on {}",
        len,
        offset,
        name
    ))]
    ReadFailed { name: String, offset: u64, len: u64 },
    #[snafu(display(
        "write of {} bytes at offset {} failed on {}",
        len,
        offset,
        name
    ))]
    WriteFailed { name: String, offset: u64, len: u64 },
    #[snafu(display("cache flush failed on {}", name))]
    FlushFailed { name: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum DmaError {
    #[snafu(display("failed to allocate buffer of {} bytes", size))]
    Alloc { size: u64 },
}

/// Owned, zero-initialized I/O buffer. There is no DMA engine underneath
/// this crate, but allocation stays fallible so device backends that do
/// hand out constrained memory can keep the same surface.
pub struct DmaBuf {
    buf: Vec<u8>,
}

impl DmaBuf {
    /// A buffer larger than this is a runaway caller, not a real label
    /// region.
    const MAX_SIZE: u64 = 1 << 30;

    pub fn new(size: u64, _alignment: u64) -> Result<DmaBuf, DmaError> {
        if size == 0 || size > DmaBuf::MAX_SIZE {
            return Err(DmaError::Alloc {
                size,
            });
        }
        Ok(DmaBuf {
            buf: vec![0u8; size as usize],
        })
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DmaBuf {{ len: {} }}", self.buf.len())
    }
}
