use bfs_config::{AllocationDiscipline, BfsConfig};
use device::attach_devices;

use crate::{AllocDiscipline, ClusterError, VertBlockCluster};

impl From<AllocationDiscipline> for AllocDiscipline {
    fn from(d: AllocationDiscipline) -> Self {
        match d {
            AllocationDiscipline::Linear => Self::Linear,
            AllocationDiscipline::Interleave => Self::Interleave,
        }
    }
}

/// Assemble the whole block layer from configuration: attach every device in
/// `bfsDeviceLayer`, then open the cluster with the discipline and cache
/// settings from `bfsBlockLayer`.
pub fn open_from_config(cfg: &BfsConfig) -> Result<VertBlockCluster, ClusterError> {
    let devices = attach_devices(&cfg.device_layer)?;
    let cache = cfg
        .block_layer
        .cache_enabled
        .then_some(cfg.block_layer.cache_max_blocks);
    VertBlockCluster::open(
        devices,
        cfg.block_layer.allocation_discipline.into(),
        cache,
    )
}
