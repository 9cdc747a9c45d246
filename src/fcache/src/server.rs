use parking_lot::Mutex;
use secomm::{SecAssociation, SecureChannel};
use tracing::debug;
use wire::fs::{decode_fs, encode_fs, FsHeader, FsMsg, FsOp, PayloadReader, PayloadWriter};

use crate::FcacheError;

/// The subset of file-server operations the cache layer drives. The real
/// implementation speaks the filesystem RPC protocol; tests substitute an
/// in-memory server.
pub trait FileServer: Send + Sync {
    fn open(&self, path: &str, flags: u32) -> Result<u64, FcacheError>;

    fn create(&self, path: &str, mode: u32, flags: u32) -> Result<u64, FcacheError>;

    fn read_at(&self, handle: u64, offset: u64, size: u64) -> Result<Vec<u8>, FcacheError>;

    /// Returns the number of bytes the server accepted.
    fn write_at(&self, handle: u64, offset: u64, data: &[u8]) -> Result<u64, FcacheError>;

    fn truncate(&self, path: &str, size: u64) -> Result<(), FcacheError>;

    fn release(&self, handle: u64) -> Result<(), FcacheError>;
}

/// File attributes as reported by `GETATTR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub mode: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// File-server RPC client over one secure channel.
///
/// Every operation is a single synchronous request/response exchange held
/// under the channel mutex, so responses always pair with their requests.
pub struct RpcFileServer {
    chan: Mutex<SecureChannel>,
}

impl RpcFileServer {
    pub fn connect(host: &str, port: u16, sa: SecAssociation) -> Result<Self, FcacheError> {
        let chan = SecureChannel::connect(host, port, sa)?;
        Ok(Self { chan: Mutex::new(chan) })
    }

    pub fn from_channel(chan: SecureChannel) -> Self {
        Self { chan: Mutex::new(chan) }
    }

    fn exchange(&self, op: FsOp, payload: &[u8]) -> Result<Vec<u8>, FcacheError> {
        let msg = encode_fs(FsHeader { op, msg: FsMsg::Request }, payload);

        let chan = self.chan.lock();
        chan.send(&msg)?;
        let resp = chan.recv()?;
        drop(chan);

        let (hdr, body) = decode_fs(&resp)?;
        if hdr.op != op || hdr.msg != FsMsg::Response {
            return Err(FcacheError::Protocol("response for wrong operation"));
        }
        debug!(op = ?op, len = body.len(), "rpc complete");
        Ok(body.to_vec())
    }

    /// Exchange expecting a leading result code; negative results become
    /// [`FcacheError::Remote`].
    fn call(&self, op: FsOp, payload: &[u8]) -> Result<(i64, Vec<u8>), FcacheError> {
        let body = self.exchange(op, payload)?;
        let mut rd = PayloadReader::new(&body);
        let res = rd.i64()?;
        if res < 0 {
            return Err(FcacheError::Remote(res));
        }
        Ok((res, rd.tail().to_vec()))
    }

    pub fn init(&self) -> Result<(), FcacheError> {
        self.call(FsOp::Init, &[]).map(|_| ())
    }

    pub fn init_mkfs(&self) -> Result<(), FcacheError> {
        self.call(FsOp::InitMkfs, &[]).map(|_| ())
    }

    pub fn destroy(&self) -> Result<(), FcacheError> {
        self.call(FsOp::Destroy, &[]).map(|_| ())
    }

    pub fn getattr(&self, path: &str) -> Result<FileAttr, FcacheError> {
        let payload = PayloadWriter::new().bytes(path.as_bytes()).finish();
        let (_, rest) = self.call(FsOp::Getattr, &payload)?;
        let mut rd = PayloadReader::new(&rest);
        Ok(FileAttr {
            mode: rd.u32()?,
            size: rd.u64()?,
            atime: rd.u64()?,
            mtime: rd.u64()?,
            ctime: rd.u64()?,
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().u32(mode).bytes(path.as_bytes()).finish();
        self.call(FsOp::Mkdir, &payload).map(|_| ())
    }

    pub fn unlink(&self, path: &str) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().bytes(path.as_bytes()).finish();
        self.call(FsOp::Unlink, &payload).map(|_| ())
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().bytes(path.as_bytes()).finish();
        self.call(FsOp::Rmdir, &payload).map(|_| ())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new()
            .bytes(from.as_bytes())
            .bytes(to.as_bytes())
            .finish();
        self.call(FsOp::Rename, &payload).map(|_| ())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().u32(mode).bytes(path.as_bytes()).finish();
        self.call(FsOp::Chmod, &payload).map(|_| ())
    }

    pub fn opendir(&self, path: &str) -> Result<u64, FcacheError> {
        let payload = PayloadWriter::new().bytes(path.as_bytes()).finish();
        let (res, _) = self.call(FsOp::Opendir, &payload)?;
        Ok(res as u64)
    }

    pub fn readdir(&self, handle: u64) -> Result<Vec<String>, FcacheError> {
        let payload = PayloadWriter::new().u64(handle).finish();
        let (_, rest) = self.call(FsOp::Readdir, &payload)?;
        let mut rd = PayloadReader::new(&rest);
        let count = rd.u32()?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            names.push(rd.string()?);
        }
        Ok(names)
    }
}

impl FileServer for RpcFileServer {
    fn open(&self, path: &str, flags: u32) -> Result<u64, FcacheError> {
        let payload = PayloadWriter::new().u32(flags).bytes(path.as_bytes()).finish();
        let (res, _) = self.call(FsOp::Open, &payload)?;
        Ok(res as u64)
    }

    fn create(&self, path: &str, mode: u32, flags: u32) -> Result<u64, FcacheError> {
        let payload = PayloadWriter::new()
            .u32(mode)
            .u32(flags)
            .bytes(path.as_bytes())
            .finish();
        let (res, _) = self.call(FsOp::Create, &payload)?;
        Ok(res as u64)
    }

    fn read_at(&self, handle: u64, offset: u64, size: u64) -> Result<Vec<u8>, FcacheError> {
        let payload = PayloadWriter::new().u64(handle).u64(size).u64(offset).finish();
        let (res, data) = self.call(FsOp::Read, &payload)?;
        if data.len() as u64 != res as u64 {
            return Err(FcacheError::Protocol("read length disagrees with result"));
        }
        Ok(data)
    }

    fn write_at(&self, handle: u64, offset: u64, data: &[u8]) -> Result<u64, FcacheError> {
        let payload = PayloadWriter::new()
            .u64(handle)
            .u64(data.len() as u64)
            .u64(offset)
            .tail(data)
            .finish();
        let (res, _) = self.call(FsOp::Write, &payload)?;
        Ok(res as u64)
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().u64(size).bytes(path.as_bytes()).finish();
        self.call(FsOp::Truncate, &payload).map(|_| ())
    }

    fn release(&self, handle: u64) -> Result<(), FcacheError> {
        let payload = PayloadWriter::new().u64(handle).finish();
        self.call(FsOp::Release, &payload).map(|_| ())
    }
}
