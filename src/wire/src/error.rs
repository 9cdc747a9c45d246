use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("length field disagrees with payload: {0}")]
    Length(&'static str),

    #[error("malformed field: {0}")]
    Malformed(&'static str),

    #[error("unknown device command {0}")]
    UnknownCommand(u8),

    #[error("unknown filesystem op {0}")]
    UnknownOp(i32),
}
