use std::io;

use thiserror::Error;

/// Failures on a secure channel. All variants are session-fatal: the channel
/// never resynchronizes after a bad frame, the caller must tear it down.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("AEAD failure during {0}")]
    Crypto(&'static str),

    #[error("sequence counter exhausted at {0}")]
    Sequence(u32),
}
