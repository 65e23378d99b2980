//! Materializes vdev topology into property trees: the per-vdev
//! recursion and the full label payload a leaf gets stamped with. Both
//! are pure with respect to on-disk state; everything comes from the
//! in-memory tree and the pool handle.

use std::sync::Arc;

use crate::{
    nvlist::{keys, NvList},
    pool::{PoolContext, VERSION_RAIDZ2},
    vdev::{Vdev, VdevType},
};

use super::vdev_label::LabelError;

/// Largest parity count any version supports.
const RAIDZ_MAX_PARITY: u64 = 2;

/// Describe one vdev (and, for interior nodes, its subtree) as a
/// property tree. With `as_spare` the description is reduced to what a
/// shared spare needs; `include_stats` appends the fixed-shape runtime
/// stats record.
pub(crate) fn vdev_config(
    pool: &PoolContext,
    vd: &Arc<Vdev>,
    include_stats: bool,
    as_spare: bool,
) -> Result<NvList, LabelError> {
    let mut nv = NvList::new();

    nv.add_str(keys::VDEV_TYPE, vd.vtype().as_str());
    if !as_spare {
        nv.add_u64(keys::VDEV_ID, vd.id());
    }
    nv.add_u64(keys::GUID, vd.guid());

    if let Some(path) = &vd.path {
        nv.add_str(keys::VDEV_PATH, path);
    }
    if let Some(devid) = &vd.devid {
        nv.add_str(keys::VDEV_DEVID, devid);
    }
    if let Some(physpath) = &vd.physpath {
        nv.add_str(keys::VDEV_PHYSPATH, physpath);
    }

    if vd.vtype() == VdevType::Raidz {
        let nparity = vd.nparity();
        if nparity < 1 || nparity > RAIDZ_MAX_PARITY {
            return Err(LabelError::InvalidArgument {
                name: vd.name(),
            });
        }
        if nparity > 1 && pool.version < VERSION_RAIDZ2 {
            return Err(LabelError::InvalidArgument {
                name: vd.name(),
            });
        }
        nv.add_u64(keys::VDEV_NPARITY, nparity);
    }

    if vd.wholedisk {
        nv.add_u64(keys::VDEV_WHOLE_DISK, 1);
    }
    if vd.not_present() {
        nv.add_u64(keys::VDEV_NOT_PRESENT, 1);
    }
    if vd.is_spare() {
        nv.add_u64(keys::VDEV_IS_SPARE, 1);
    }

    if vd.is_top() && !as_spare {
        nv.add_u64(keys::VDEV_METASLAB_ARRAY, vd.ms_array());
        nv.add_u64(keys::VDEV_METASLAB_SHIFT, vd.ms_shift());
        nv.add_u64(keys::VDEV_ASHIFT, vd.ashift());
        nv.add_u64(keys::VDEV_ASIZE, vd.asize());
        nv.add_u64(keys::VDEV_IS_LOG, vd.is_log() as u64);
    }

    if vd.dtl_object() != 0 {
        nv.add_u64(keys::VDEV_DTL, vd.dtl_object());
    }

    if include_stats {
        nv.add_u64_array(keys::VDEV_STATS, vd.stats().as_record());
    }

    if !vd.is_leaf() {
        let mut children = Vec::with_capacity(vd.children().len());
        for child in vd.children() {
            children.push(vdev_config(pool, child, include_stats, false)?);
        }
        nv.add_list_array(keys::VDEV_CHILDREN, children);
    } else {
        if vd.offline() && !vd.offline_temporary() {
            nv.add_u64(keys::VDEV_OFFLINE, 1);
        }
        if vd.faulted() {
            nv.add_u64(keys::VDEV_FAULTED, 1);
        }
        if vd.degraded() {
            nv.add_u64(keys::VDEV_DEGRADED, 1);
        }
        if vd.removed() {
            nv.add_u64(keys::VDEV_REMOVED, 1);
        }
        if vd.unspare() {
            nv.add_u64(keys::VDEV_UNSPARE, 1);
        }
    }

    Ok(nv)
}

/// The label payload for a leaf: pool identity plus the topology of the
/// leaf's top-level vdev. `txg` is the pool txg the label belongs to;
/// freshly initialized labels carry zero until their first sync.
pub(crate) fn pool_config(
    pool: &PoolContext,
    vd: &Arc<Vdev>,
    txg: u64,
) -> Result<NvList, LabelError> {
    let top = vd.top();
    let mut nv = NvList::new();

    nv.add_u64(keys::VERSION, pool.version);
    nv.add_str(keys::POOL_NAME, &pool.name);
    nv.add_u64(keys::POOL_STATE, pool.state.as_u64());
    nv.add_u64(keys::POOL_TXG, txg);
    nv.add_u64(keys::POOL_GUID, pool.guid);
    nv.add_u64(keys::TOP_GUID, top.guid());
    nv.add_u64(keys::GUID, vd.guid());
    nv.add_list(keys::VDEV_TREE, vdev_config(pool, &top, false, false)?);

    Ok(nv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::MemDevice,
        pool::{PoolRegistry, SpareRegistry, VERSION_CURRENT},
    };
    use assert_matches::assert_matches;

    fn leaf(guid: u64) -> Arc<Vdev> {
        let dev = MemDevice::new(&format!("mem-{}", guid), 16 << 20);
        Vdev::disk(guid, 9, dev, Some(&format!("/dev/mem-{}", guid)))
    }

    fn pool_with(root: Arc<Vdev>, version: u64) -> PoolContext {
        PoolContext::new(
            "tank",
            7000,
            version,
            root,
            PoolRegistry::new(),
            SpareRegistry::new(),
        )
    }

    #[test]
    fn mirror_config_shape() {
        let a = leaf(100);
        let b = leaf(200);
        let mirror = Vdev::mirror(300, vec![a, b]);
        mirror.set_metaslab(32, 30);
        let root = Vdev::root(1, vec![mirror.clone()]);
        let pool = pool_with(root, VERSION_CURRENT);

        let nv = vdev_config(&pool, &mirror, false, false).unwrap();
        assert_eq!(nv.get_str(keys::VDEV_TYPE), Some("mirror"));
        assert_eq!(nv.get_u64(keys::GUID), Some(300));
        assert_eq!(nv.get_u64(keys::VDEV_METASLAB_ARRAY), Some(32));
        assert_eq!(nv.get_u64(keys::VDEV_IS_LOG), Some(0));

        let children = nv.get_list_array(keys::VDEV_CHILDREN).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get_u64(keys::GUID), Some(100));
        assert_eq!(children[0].get_str(keys::VDEV_TYPE), Some("disk"));
        assert!(children[0].get_str(keys::VDEV_PATH).is_some());
        // leaves never carry allocation keys
        assert!(!children[0].contains(keys::VDEV_METASLAB_ARRAY));
    }

    #[test]
    fn spare_config_has_no_id() {
        let a = leaf(100);
        let root = Vdev::root(1, vec![a.clone()]);
        let pool = pool_with(root, VERSION_CURRENT);

        let nv = vdev_config(&pool, &a, false, true).unwrap();
        assert!(!nv.contains(keys::VDEV_ID));
        assert_eq!(nv.get_u64(keys::GUID), Some(100));
    }

    #[test]
    fn raidz2_rejected_on_old_version() {
        let children = vec![leaf(100), leaf(200), leaf(400)];
        let raidz = Vdev::raidz(300, 2, children);
        let root = Vdev::root(1, vec![raidz.clone()]);
        let pool = pool_with(root, VERSION_RAIDZ2 - 1);

        assert_matches!(
            vdev_config(&pool, &raidz, false, false),
            Err(LabelError::InvalidArgument { .. })
        );
    }

    #[test]
    fn offline_suppressed_when_temporary() {
        let a = leaf(100);
        let root = Vdev::root(1, vec![a.clone()]);
        let pool = pool_with(root, VERSION_CURRENT);

        a.set_offline(true, true);
        let nv = vdev_config(&pool, &a, false, false).unwrap();
        assert!(!nv.contains(keys::VDEV_OFFLINE));

        a.set_offline(true, false);
        let nv = vdev_config(&pool, &a, false, false).unwrap();
        assert_eq!(nv.get_u64(keys::VDEV_OFFLINE), Some(1));
    }

    #[test]
    fn label_payload_names_pool_and_top() {
        let a = leaf(100);
        let b = leaf(200);
        let mirror = Vdev::mirror(300, vec![a.clone(), b]);
        let root = Vdev::root(1, vec![mirror]);
        let pool = pool_with(root, VERSION_CURRENT);

        let nv = pool_config(&pool, &a, 7).unwrap();
        assert_eq!(nv.get_u64(keys::POOL_GUID), Some(7000));
        assert_eq!(nv.get_u64(keys::POOL_TXG), Some(7));
        assert_eq!(nv.get_u64(keys::TOP_GUID), Some(300));
        assert_eq!(nv.get_u64(keys::GUID), Some(100));
        let tree = nv.get_list(keys::VDEV_TREE).unwrap();
        assert_eq!(tree.get_u64(keys::GUID), Some(300));
    }

    #[test]
    fn stats_record_shape() {
        let a = leaf(100);
        let root = Vdev::root(1, vec![a.clone()]);
        let pool = pool_with(root, VERSION_CURRENT);

        let nv = vdev_config(&pool, &a, true, false).unwrap();
        let record = nv.get_u64_array(keys::VDEV_STATS).unwrap();
        assert_eq!(record.len(), 8);
    }
}
