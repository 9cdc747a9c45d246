mod device;
mod error;
pub mod fs;

pub use device::*;
pub use error::*;

/// Fixed block payload size across the whole system.
pub const BLOCK_SIZE: usize = 4096;
