//! Label and uberblock management for pooled copy-on-write storage.
//!
//! Every physical device that belongs to a pool carries four fixed-size
//! label slots, two at the front of the device and two at the back. A
//! label identifies the device's pool membership and the topology of its
//! top-level vdev, and embeds a ring of uberblocks, the rolling sequence
//! of pool roots. The write ordering implemented by [`vdev::vdev_sync`]
//! guarantees that after a power loss at any instant, some combination of
//! labels and uberblocks still describes a consistent pool.
//!
//! The crate exposes five operations to the rest of the storage pool:
//!
//! * [`vdev::vdev_label::label_offset`] - label slot geometry
//! * [`pool::PoolContext::read_config`] - read the first valid label
//! * [`pool::PoolContext::label_init`] - stamp fresh labels on a leaf
//! * [`pool::PoolContext::uberblock_load`] - elect the best pool root
//! * [`pool::PoolContext::config_sync`] - commit a new pool root
//!
//! Block allocation, transaction-group scheduling and the data I/O
//! pipeline live above and below this crate; devices are reached through
//! the [`core::BlockDevice`] trait.

#[macro_use]
extern crate log;

pub mod core;
pub mod logger;
pub mod nvlist;
pub mod pool;
pub mod vdev;

pub use crate::{
    pool::{PoolContext, PoolRegistry, PoolState, SpareRegistry},
    vdev::{
        vdev_label::{label_offset, LabelError, LabelInitReason},
        vdev_uberblock::Uberblock,
        Vdev,
        VdevType,
    },
};
