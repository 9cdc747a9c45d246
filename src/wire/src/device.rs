//! Block-device protocol codec.
//!
//! Every device frame is `header || body` with a fixed 18-byte header,
//! integers little-endian:
//!
//! ```text
//! user_id:u64  device_id:u32  command:u8  ack:u8  body_len:u32
//! ```
//!
//! Requests carry `ack = 0`, responses echo the command with `ack = 1`.

use crate::{WireError, BLOCK_SIZE};

pub const HEADER_LEN: usize = 18;

/// Largest id count accepted in one bulk request.
pub const MAX_BATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceCmd {
    GetTopo = 0,
    GetBlock = 1,
    PutBlock = 2,
    GetBlocks = 3,
    PutBlocks = 4,
}

impl TryFrom<u8> for DeviceCmd {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::GetTopo),
            1 => Ok(Self::GetBlock),
            2 => Ok(Self::PutBlock),
            3 => Ok(Self::GetBlocks),
            4 => Ok(Self::PutBlocks),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl DeviceCmd {
    pub fn name(self) -> &'static str {
        match self {
            Self::GetTopo => "GET_TOPO",
            Self::GetBlock => "GET_BLOCK",
            Self::PutBlock => "PUT_BLOCK",
            Self::GetBlocks => "GET_BLOCKS",
            Self::PutBlocks => "PUT_BLOCKS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub user_id: u64,
    pub device_id: u32,
    pub cmd: DeviceCmd,
    pub ack: bool,
}

impl PacketHeader {
    pub fn request(user_id: u64, device_id: u32, cmd: DeviceCmd) -> Self {
        Self { user_id, device_id, cmd, ack: false }
    }

    /// The response header for this request: same identities, ack flipped.
    pub fn response(&self) -> Self {
        Self { ack: true, ..*self }
    }
}

pub fn encode_packet(hdr: &PacketHeader, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&hdr.user_id.to_le_bytes());
    out.extend_from_slice(&hdr.device_id.to_le_bytes());
    out.push(hdr.cmd as u8);
    out.push(hdr.ack as u8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_packet(buf: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated { need: HEADER_LEN, have: buf.len() });
    }
    let user_id = u64::from_le_bytes(buf[0..8].try_into().expect("sliced"));
    let device_id = u32::from_le_bytes(buf[8..12].try_into().expect("sliced"));
    let cmd = DeviceCmd::try_from(buf[12])?;
    let ack = match buf[13] {
        0 => false,
        1 => true,
        _ => return Err(WireError::Malformed("ack flag")),
    };
    let body_len = u32::from_le_bytes(buf[14..18].try_into().expect("sliced")) as usize;
    let body = &buf[HEADER_LEN..];
    if body.len() != body_len {
        return Err(WireError::Length("body length mismatch"));
    }
    Ok((PacketHeader { user_id, device_id, cmd, ack }, body))
}

// --- body codecs -----------------------------------------------------------

pub fn encode_topo(device_id: u32, num_blocks: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&device_id.to_le_bytes());
    out.extend_from_slice(&num_blocks.to_le_bytes());
    out
}

pub fn decode_topo(body: &[u8]) -> Result<(u32, u64), WireError> {
    if body.len() != 12 {
        return Err(WireError::Length("topo body"));
    }
    let device_id = u32::from_le_bytes(body[0..4].try_into().expect("sliced"));
    let num_blocks = u64::from_le_bytes(body[4..12].try_into().expect("sliced"));
    Ok((device_id, num_blocks))
}

pub fn encode_pbid(pbid: u64) -> Vec<u8> {
    pbid.to_le_bytes().to_vec()
}

pub fn decode_pbid(body: &[u8]) -> Result<u64, WireError> {
    if body.len() != 8 {
        return Err(WireError::Length("pbid body"));
    }
    Ok(u64::from_le_bytes(body.try_into().expect("sized")))
}

/// `GET_BLOCK` response / `PUT_BLOCK` request: `data(4096) || pbid:u64`.
pub fn encode_block_with_id(data: &[u8; BLOCK_SIZE], pbid: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_SIZE + 8);
    out.extend_from_slice(data);
    out.extend_from_slice(&pbid.to_le_bytes());
    out
}

pub fn decode_block_with_id(body: &[u8]) -> Result<(&[u8; BLOCK_SIZE], u64), WireError> {
    if body.len() != BLOCK_SIZE + 8 {
        return Err(WireError::Length("block body"));
    }
    let data: &[u8; BLOCK_SIZE] = body[..BLOCK_SIZE].try_into().expect("sliced");
    let pbid = u64::from_le_bytes(body[BLOCK_SIZE..].try_into().expect("sliced"));
    Ok((data, pbid))
}

/// `GET_BLOCKS` request / `PUT_BLOCKS` response: `count:u32 || pbid*count`.
pub fn encode_id_list(ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ids.len() * 8);
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn decode_id_list(body: &[u8]) -> Result<Vec<u64>, WireError> {
    if body.len() < 4 {
        return Err(WireError::Truncated { need: 4, have: body.len() });
    }
    let count = u32::from_le_bytes(body[0..4].try_into().expect("sliced")) as usize;
    if count > MAX_BATCH {
        return Err(WireError::Length("batch too large"));
    }
    if body.len() != 4 + count * 8 {
        return Err(WireError::Length("id list body"));
    }
    Ok(body[4..]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().expect("chunked")))
        .collect())
}

/// `GET_BLOCKS` response / `PUT_BLOCKS` request:
/// `count:u32 || (pbid:u64 || data(4096))*count`.
pub fn encode_block_list(blocks: &[(u64, &[u8; BLOCK_SIZE])]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + blocks.len() * (8 + BLOCK_SIZE));
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    for (pbid, data) in blocks {
        out.extend_from_slice(&pbid.to_le_bytes());
        out.extend_from_slice(*data);
    }
    out
}

pub fn decode_block_list(body: &[u8]) -> Result<Vec<(u64, Vec<u8>)>, WireError> {
    if body.len() < 4 {
        return Err(WireError::Truncated { need: 4, have: body.len() });
    }
    let count = u32::from_le_bytes(body[0..4].try_into().expect("sliced")) as usize;
    if count > MAX_BATCH {
        return Err(WireError::Length("batch too large"));
    }
    if body.len() != 4 + count * (8 + BLOCK_SIZE) {
        return Err(WireError::Length("block list body"));
    }
    let mut out = Vec::with_capacity(count);
    for rec in body[4..].chunks_exact(8 + BLOCK_SIZE) {
        let pbid = u64::from_le_bytes(rec[..8].try_into().expect("chunked"));
        out.push((pbid, rec[8..].to_vec()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let hdr = PacketHeader::request(1, 7, DeviceCmd::GetBlock);
        let pkt = encode_packet(&hdr, &encode_pbid(42));
        let (got, body) = decode_packet(&pkt).unwrap();
        assert_eq!(got, hdr);
        assert_eq!(decode_pbid(body).unwrap(), 42);
    }

    #[test]
    fn response_flips_ack_only() {
        let req = PacketHeader::request(1, 7, DeviceCmd::PutBlock);
        let resp = req.response();
        assert!(resp.ack);
        assert_eq!(resp.user_id, req.user_id);
        assert_eq!(resp.device_id, req.device_id);
        assert_eq!(resp.cmd, req.cmd);
    }

    #[test]
    fn body_length_mismatch_rejected() {
        let hdr = PacketHeader::request(1, 7, DeviceCmd::GetTopo);
        let mut pkt = encode_packet(&hdr, &[]);
        pkt.push(0xff);
        assert_eq!(
            decode_packet(&pkt),
            Err(WireError::Length("body length mismatch"))
        );
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            decode_packet(&[0u8; 10]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        let mut pkt = encode_packet(&PacketHeader::request(1, 7, DeviceCmd::GetTopo), &[]);
        pkt[12] = 9;
        assert_eq!(decode_packet(&pkt), Err(WireError::UnknownCommand(9)));
    }

    #[test]
    fn bad_ack_byte_rejected() {
        let mut pkt = encode_packet(&PacketHeader::request(1, 7, DeviceCmd::GetTopo), &[]);
        pkt[13] = 2;
        assert_eq!(decode_packet(&pkt), Err(WireError::Malformed("ack flag")));
    }

    #[test]
    fn block_body_round_trip() {
        let data = [0xABu8; BLOCK_SIZE];
        let body = encode_block_with_id(&data, 9);
        let (got, pbid) = decode_block_with_id(&body).unwrap();
        assert_eq!(got[..], data[..]);
        assert_eq!(pbid, 9);
    }

    #[test]
    fn id_list_round_trip() {
        let ids = [3u64, 1, 4, 1, 5];
        assert_eq!(decode_id_list(&encode_id_list(&ids)).unwrap(), ids);
    }

    #[test]
    fn block_list_round_trip() {
        let a = [0x11u8; BLOCK_SIZE];
        let b = [0x22u8; BLOCK_SIZE];
        let body = encode_block_list(&[(0, &a), (5, &b)]);
        let got = decode_block_list(&body).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[0].1, a.to_vec());
        assert_eq!(got[1].0, 5);
        assert_eq!(got[1].1, b.to_vec());
    }

    #[test]
    fn oversized_batch_rejected() {
        let mut body = ((MAX_BATCH + 1) as u32).to_le_bytes().to_vec();
        body.resize(4 + (MAX_BATCH + 1) * 8, 0);
        assert_eq!(
            decode_id_list(&body),
            Err(WireError::Length("batch too large"))
        );
    }

    #[test]
    fn topo_round_trip() {
        let body = encode_topo(2, 1 << 20);
        assert_eq!(decode_topo(&body).unwrap(), (2, 1 << 20));
    }
}
