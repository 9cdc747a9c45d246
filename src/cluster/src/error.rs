use device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("virtual block {vbid} unmappable: cluster holds {total} blocks")]
    UnmappableAddress { vbid: u64, total: u64 },

    #[error("dirty block flush failed on eviction: {0}")]
    CacheFlush(#[source] DeviceError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("cluster halted after a flush failure")]
    Errored,

    #[error("invalid cluster configuration: {0}")]
    Config(&'static str),
}
