//! The trait a physical device must implement to carry labels. This is
//! the seam between the label subsystem and the actual I/O pipeline;
//! checksumming of data blocks, mirroring and retry policy all live on
//! the far side of it.

use async_trait::async_trait;

use crate::core::CoreError;

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockDeviceIoStats {
    pub num_read_ops: u64,
    pub num_write_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Total size in bytes of the device.
    fn size_in_bytes(&self) -> u64;

    /// Size of a block of the underlying device.
    fn block_len(&self) -> u64;

    /// Number of blocks of the device.
    fn num_blocks(&self) -> u64 {
        self.size_in_bytes() / self.block_len()
    }

    /// Name of the device.
    fn device_name(&self) -> String;

    /// Alignment (log2) required for I/O buffers.
    fn alignment(&self) -> u64;

    /// I/O counters as maintained by the device itself.
    fn io_stats(&self) -> BlockDeviceIoStats;

    async fn read_at(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<u64, CoreError>;

    async fn write_at(&self, offset: u64, buf: &[u8])
        -> Result<u64, CoreError>;

    /// Flush the device write cache. The barrier phases of the sync
    /// orchestrator are built out of this.
    async fn flush(&self) -> Result<(), CoreError>;
}
