use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Channel(#[from] secomm::ChannelError),

    #[error(transparent)]
    Config(#[from] bfs_config::ConfigError),

    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error("device protocol violation: {0}")]
    Protocol(&'static str),

    #[error("physical block {pbid} outside device geometry of {num_blocks} blocks")]
    OutOfRange { pbid: u64, num_blocks: u64 },

    #[error("storage backend failure: {0}")]
    Storage(&'static str),
}
