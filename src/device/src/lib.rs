mod block;
mod error;
mod layer;
mod local;
mod remote;
mod server;
mod storage;

pub use block::*;
pub use error::*;
pub use layer::*;
pub use local::*;
pub use remote::*;
pub use server::*;
pub use storage::*;

pub use wire::BLOCK_SIZE;

/// One addressable store of 4 KiB physical blocks.
///
/// Implementations are either in-process (a memory-mapped image) or remote
/// (a storage daemon reached over a secure channel). All implementations are
/// shareable handles: cached blocks hold an `Arc<dyn BlockDevice>` back to
/// their owner for flush-on-eviction.
pub trait BlockDevice: Send + Sync {
    fn device_id(&self) -> u32;

    fn num_blocks(&self) -> u64;

    /// Read one physical block into `out`.
    fn get_block(&self, pbid: u64, out: &mut Block) -> Result<(), DeviceError>;

    /// Write one physical block.
    fn put_block(&self, pbid: u64, data: &Block) -> Result<(), DeviceError>;

    /// Bulk read; results come back in request order.
    fn get_blocks(&self, pbids: &[u64]) -> Result<Vec<(u64, Block)>, DeviceError>;

    /// Bulk write.
    fn put_blocks(&self, blocks: &[(u64, Block)]) -> Result<(), DeviceError>;
}
