mod channel;
mod error;
mod mux;
mod sa;

pub use channel::*;
pub use error::*;
pub use mux::*;
pub use sa::*;
