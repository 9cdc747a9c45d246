use parking_lot::Mutex;
use secomm::{SecAssociation, SecureChannel};
use tracing::{debug, info};
use wire::{DeviceCmd, PacketHeader};

use crate::{Block, BlockDevice, DeviceError};

/// A storage daemon reached over a secure channel.
///
/// One request/response exchange is in flight at a time: the channel mutex is
/// held across both halves so responses pair with their requests and the SA
/// sequence windows stay aligned. Geometry is learned from `GET_TOPO` when
/// the device attaches.
pub struct RemoteDevice {
    did: u32,
    user_id: u64,
    num_blocks: u64,
    chan: Mutex<SecureChannel>,
}

impl RemoteDevice {
    pub fn connect(
        host: &str,
        port: u16,
        did: u32,
        user_id: u64,
        sa: SecAssociation,
    ) -> Result<Self, DeviceError> {
        let chan = SecureChannel::connect(host, port, sa)?;
        let dev = Self { did, user_id, num_blocks: 0, chan: Mutex::new(chan) };

        let body = dev.exchange(DeviceCmd::GetTopo, &[])?;
        let (rdid, num_blocks) = wire::decode_topo(&body)?;
        if rdid != did {
            return Err(DeviceError::Protocol("topology device id mismatch"));
        }
        info!(did, num_blocks, "remote device attached");
        Ok(Self { num_blocks, ..dev })
    }

    fn exchange(&self, cmd: DeviceCmd, body: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let hdr = PacketHeader::request(self.user_id, self.did, cmd);
        let pkt = wire::encode_packet(&hdr, body);

        // hold the channel for the full request/response pair
        let chan = self.chan.lock();
        chan.send(&pkt)?;
        let resp = chan.recv()?;
        drop(chan);

        let (rhdr, rbody) = wire::decode_packet(&resp)?;
        if !rhdr.ack
            || rhdr.cmd != cmd
            || rhdr.device_id != self.did
            || rhdr.user_id != self.user_id
        {
            return Err(DeviceError::Protocol("response header mismatch"));
        }
        debug!(cmd = cmd.name(), len = rbody.len(), "device exchange complete");
        Ok(rbody.to_vec())
    }

    fn check_range(&self, pbid: u64) -> Result<(), DeviceError> {
        if pbid >= self.num_blocks {
            return Err(DeviceError::OutOfRange { pbid, num_blocks: self.num_blocks });
        }
        Ok(())
    }
}

impl BlockDevice for RemoteDevice {
    fn device_id(&self) -> u32 {
        self.did
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn get_block(&self, pbid: u64, out: &mut Block) -> Result<(), DeviceError> {
        self.check_range(pbid)?;
        let body = self.exchange(DeviceCmd::GetBlock, &wire::encode_pbid(pbid))?;
        let (data, rpbid) = wire::decode_block_with_id(&body)?;
        if rpbid != pbid {
            return Err(DeviceError::Protocol("response for wrong block"));
        }
        out.as_bytes_mut().copy_from_slice(data);
        Ok(())
    }

    fn put_block(&self, pbid: u64, data: &Block) -> Result<(), DeviceError> {
        self.check_range(pbid)?;
        let body = self.exchange(
            DeviceCmd::PutBlock,
            &wire::encode_block_with_id(data.as_bytes(), pbid),
        )?;
        if wire::decode_pbid(&body)? != pbid {
            return Err(DeviceError::Protocol("ack for wrong block"));
        }
        Ok(())
    }

    fn get_blocks(&self, pbids: &[u64]) -> Result<Vec<(u64, Block)>, DeviceError> {
        for &pbid in pbids {
            self.check_range(pbid)?;
        }
        let body = self.exchange(DeviceCmd::GetBlocks, &wire::encode_id_list(pbids))?;
        let raw = wire::decode_block_list(&body)?;
        if raw.len() != pbids.len() {
            return Err(DeviceError::Protocol("bulk read count mismatch"));
        }
        let mut out = Vec::with_capacity(raw.len());
        for ((pbid, data), &want) in raw.into_iter().zip(pbids) {
            if pbid != want {
                return Err(DeviceError::Protocol("bulk read id mismatch"));
            }
            out.push((pbid, Block::from_slice(&data)?));
        }
        Ok(out)
    }

    fn put_blocks(&self, blocks: &[(u64, Block)]) -> Result<(), DeviceError> {
        for (pbid, _) in blocks {
            self.check_range(*pbid)?;
        }
        let list: Vec<(u64, &[u8; wire::BLOCK_SIZE])> =
            blocks.iter().map(|(pbid, b)| (*pbid, b.as_bytes())).collect();
        let body = self.exchange(DeviceCmd::PutBlocks, &wire::encode_block_list(&list))?;
        let acked = wire::decode_id_list(&body)?;
        if acked.len() != blocks.len() {
            return Err(DeviceError::Protocol("bulk write count mismatch"));
        }
        Ok(())
    }
}
