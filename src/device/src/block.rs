use std::fmt;
use std::ops::{Deref, DerefMut};

use wire::BLOCK_SIZE;

use crate::DeviceError;

/// A heap-allocated 4 KiB block payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Block(Box<[u8; BLOCK_SIZE]>);

impl Block {
    pub fn zeroed() -> Self {
        Self(Box::new([0u8; BLOCK_SIZE]))
    }

    pub fn filled(byte: u8) -> Self {
        Self(Box::new([byte; BLOCK_SIZE]))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, DeviceError> {
        let arr: [u8; BLOCK_SIZE] = data
            .try_into()
            .map_err(|_| DeviceError::Storage("bad block payload length"))?;
        Ok(Self(Box::new(arr)))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Deref for Block {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}
