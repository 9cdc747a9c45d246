use std::path::Path;

use crate::{Block, BlockDevice, DeviceError, MappedStorage};

/// A device backed by an image mapped into the current process. Used by
/// single-node deployments and throughout the test suites.
pub struct LocalDevice {
    did: u32,
    storage: MappedStorage,
}

impl LocalDevice {
    pub fn open(did: u32, path: impl AsRef<Path>, num_blocks: u64) -> Result<Self, DeviceError> {
        Ok(Self { did, storage: MappedStorage::open(path, num_blocks)? })
    }
}

impl BlockDevice for LocalDevice {
    fn device_id(&self) -> u32 {
        self.did
    }

    fn num_blocks(&self) -> u64 {
        self.storage.num_blocks()
    }

    fn get_block(&self, pbid: u64, out: &mut Block) -> Result<(), DeviceError> {
        self.storage.read_block(pbid, out.as_bytes_mut().as_mut_slice())
    }

    fn put_block(&self, pbid: u64, data: &Block) -> Result<(), DeviceError> {
        self.storage.write_block(pbid, data.as_bytes().as_slice())
    }

    fn get_blocks(&self, pbids: &[u64]) -> Result<Vec<(u64, Block)>, DeviceError> {
        let mut out = Vec::with_capacity(pbids.len());
        for &pbid in pbids {
            let mut blk = Block::zeroed();
            self.storage.read_block(pbid, blk.as_bytes_mut().as_mut_slice())?;
            out.push((pbid, blk));
        }
        Ok(out)
    }

    fn put_blocks(&self, blocks: &[(u64, Block)]) -> Result<(), DeviceError> {
        for (pbid, data) in blocks {
            self.storage.write_block(*pbid, data.as_bytes().as_slice())?;
        }
        Ok(())
    }
}
