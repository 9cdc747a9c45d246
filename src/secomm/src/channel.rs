use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::sa::{OpenHalf, SealHalf, FRAME_OVERHEAD, PAD_BLOCK};
use crate::{ChannelError, SecAssociation};

/// Upper bound on a single framed message. Bulk block transfers dominate the
/// frame size; 16 MiB comfortably covers the largest accepted batch.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

struct SendHalf {
    stream: TcpStream,
    sa: SealHalf,
}

struct RecvHalf {
    stream: TcpStream,
    sa: OpenHalf,
}

/// A length-framed, AEAD-protected, replay-protected message channel bound to
/// one security association.
///
/// Send and receive are independent operations, each guarded by its own mutex
/// so a frame is always written or read atomically. Callers issuing
/// request/response pairs must hold their own lock spanning both halves to
/// keep sequence numbers aligned with their peer.
pub struct SecureChannel {
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    fd: RawFd,
    peer: SocketAddr,
}

impl SecureChannel {
    /// Connect to a listening peer and bind the session to `sa`.
    pub fn connect(host: &str, port: u16, sa: SecAssociation) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((host, port))?;
        debug!(host, port, "connected");
        Self::from_stream(stream, sa)
    }

    /// Wrap an established stream (the accept side) in a secure session.
    pub fn from_stream(stream: TcpStream, sa: SecAssociation) -> Result<Self, ChannelError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let fd = stream.as_raw_fd();
        let wstream = stream.try_clone()?;
        let (seal, open) = sa.split();
        Ok(Self {
            send: Mutex::new(SendHalf { stream: wstream, sa: seal }),
            recv: Mutex::new(RecvHalf { stream, sa: open }),
            fd,
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Seal and transmit one message as a single frame.
    pub fn send(&self, msg: &[u8]) -> Result<(), ChannelError> {
        let mut half = self.send.lock();
        let frame = half.sa.seal(msg)?;
        let len =
            u32::try_from(frame.len()).map_err(|_| ChannelError::Protocol("frame too large"))?;
        half.stream.write_all(&len.to_be_bytes())?;
        half.stream.write_all(&frame)?;
        half.stream.flush()?;
        trace!(peer = %self.peer, len = frame.len(), "frame sent");
        Ok(())
    }

    /// Block until a complete frame arrives and return the verified plaintext.
    pub fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        self.recv_bounded(MAX_FRAME)
    }

    /// As [`recv`](Self::recv) with a caller-chosen frame bound. A length
    /// prefix above the bound is a protocol violation, not a resync point.
    pub fn recv_bounded(&self, max: usize) -> Result<Vec<u8>, ChannelError> {
        let mut half = self.recv.lock();
        let mut lenb = [0u8; 4];
        half.stream.read_exact(&mut lenb)?;
        let len = u32::from_be_bytes(lenb) as usize;
        if len > max || len < FRAME_OVERHEAD + PAD_BLOCK {
            return Err(ChannelError::Protocol("bad frame length"));
        }
        let mut frame = vec![0u8; len];
        half.stream.read_exact(&mut frame)?;
        let msg = half.sa.open(&frame)?;
        trace!(peer = %self.peer, len = msg.len(), "frame received");
        Ok(msg)
    }

    /// Best-effort shutdown of both stream directions.
    pub fn shutdown(&self) {
        let half = self.send.lock();
        let _ = half.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl AsRawFd for SecureChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Accept side of channel establishment.
pub struct ChannelListener {
    inner: TcpListener,
}

impl ChannelListener {
    /// Bind on all interfaces; port 0 selects an ephemeral port.
    pub fn bind(port: u16) -> Result<Self, ChannelError> {
        let inner = TcpListener::bind(("0.0.0.0", port))?;
        debug!(port = inner.local_addr()?.port(), "listener bound");
        Ok(Self { inner })
    }

    pub fn local_port(&self) -> Result<u16, ChannelError> {
        Ok(self.inner.local_addr()?.port())
    }

    /// Accept one connection and bind it to a fresh session under `sa`.
    pub fn accept(&self, sa: SecAssociation) -> Result<SecureChannel, ChannelError> {
        let (stream, peer) = self.inner.accept()?;
        debug!(%peer, "accepted connection");
        SecureChannel::from_stream(stream, sa)
    }
}

impl AsRawFd for ChannelListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
