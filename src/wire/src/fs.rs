//! Filesystem RPC codec.
//!
//! Each filesystem frame is `op:i32le || msg:i32le || payload`. The numeric
//! op identifiers are part of the wire contract and must stay stable between
//! client and server builds.

use crate::WireError;

pub const FS_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsOp {
    Init = 0,
    InitMkfs = 1,
    Destroy = 2,
    Getattr = 3,
    Mkdir = 4,
    Unlink = 5,
    Rmdir = 6,
    Rename = 7,
    Chmod = 8,
    Open = 9,
    Opendir = 10,
    Create = 11,
    Read = 12,
    Write = 13,
    Release = 14,
    Readdir = 15,
    Truncate = 16,
}

impl TryFrom<i32> for FsOp {
    type Error = WireError;

    fn try_from(v: i32) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Init,
            1 => Self::InitMkfs,
            2 => Self::Destroy,
            3 => Self::Getattr,
            4 => Self::Mkdir,
            5 => Self::Unlink,
            6 => Self::Rmdir,
            7 => Self::Rename,
            8 => Self::Chmod,
            9 => Self::Open,
            10 => Self::Opendir,
            11 => Self::Create,
            12 => Self::Read,
            13 => Self::Write,
            14 => Self::Release,
            15 => Self::Readdir,
            16 => Self::Truncate,
            other => return Err(WireError::UnknownOp(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsMsg {
    Request = 0,
    Response = 1,
}

impl TryFrom<i32> for FsMsg {
    type Error = WireError;

    fn try_from(v: i32) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(WireError::UnknownOp(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsHeader {
    pub op: FsOp,
    pub msg: FsMsg,
}

pub fn encode_fs(hdr: FsHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FS_HEADER_LEN + payload.len());
    out.extend_from_slice(&(hdr.op as i32).to_le_bytes());
    out.extend_from_slice(&(hdr.msg as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn decode_fs(buf: &[u8]) -> Result<(FsHeader, &[u8]), WireError> {
    if buf.len() < FS_HEADER_LEN {
        return Err(WireError::Truncated { need: FS_HEADER_LEN, have: buf.len() });
    }
    let op = FsOp::try_from(i32::from_le_bytes(buf[0..4].try_into().expect("sliced")))?;
    let msg = FsMsg::try_from(i32::from_le_bytes(buf[4..8].try_into().expect("sliced")))?;
    Ok((FsHeader { op, msg }, &buf[FS_HEADER_LEN..]))
}

/// Little-endian payload writer.
#[derive(Default)]
pub struct PayloadWriter(Vec<u8>);

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(mut self, v: i64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length-prefixed byte string.
    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.0.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.0.extend_from_slice(v);
        self
    }

    /// Unprefixed trailing bytes; must be the last field.
    pub fn tail(mut self, v: &[u8]) -> Self {
        self.0.extend_from_slice(v);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// Little-endian payload reader.
pub struct PayloadReader<'a>(&'a [u8]);

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.0.len() < n {
            return Err(WireError::Truncated { need: n, have: self.0.len() });
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized")))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized")))
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("sized")))
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed("utf-8 string"))
    }

    /// All remaining bytes.
    pub fn tail(self) -> &'a [u8] {
        self.0
    }

    pub fn expect_end(self) -> Result<(), WireError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(WireError::Length("trailing bytes"))
        }
    }
}
