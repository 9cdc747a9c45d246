use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FcacheError {
    #[error("client cache I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Channel(#[from] secomm::ChannelError),

    #[error(transparent)]
    Config(#[from] bfs_config::ConfigError),

    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error("file server protocol violation: {0}")]
    Protocol(&'static str),

    #[error("file server returned error {0}")]
    Remote(i64),

    #[error("short write during flush: sent {expected} bytes, server took {got}")]
    ShortWrite { expected: u64, got: u64 },

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error("background writer failed; cache is unusable")]
    WriterFailed,
}
