use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{info, warn};
use wire::BLOCK_SIZE;

use crate::DeviceError;

/// The daemon's backing store: one raw image of `num_blocks * 4096` bytes,
/// memory-mapped read/write as a single contiguous region.
///
/// Block `i` occupies bytes `[i*4096, (i+1)*4096)`; there is no header or
/// metadata. An absent or wrong-sized image is (re)created as zeros. Reads
/// and writes are direct memory copies; durability is left to the OS, no
/// msync on the fast path.
pub struct MappedStorage {
    base: NonNull<libc::c_void>,
    len: usize,
    num_blocks: u64,
    path: PathBuf,
    _file: File,
}

// The raw mapping is only touched through the checked accessors below, and
// request handling is serialized by the daemon's event loop.
unsafe impl Send for MappedStorage {}
unsafe impl Sync for MappedStorage {}

impl MappedStorage {
    pub fn open(path: impl AsRef<Path>, num_blocks: u64) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let len = (num_blocks as usize)
            .checked_mul(BLOCK_SIZE)
            .ok_or(DeviceError::Storage("geometry overflow"))?;
        let nz_len = NonZeroUsize::new(len).ok_or(DeviceError::Storage("zero-length device"))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let actual = file.metadata()?.len();
        if actual != len as u64 {
            if actual != 0 {
                warn!(
                    path = %path.display(),
                    actual,
                    expected = len,
                    "backing image has wrong size, recreating"
                );
                // drop stale content before sizing, the image must be zeros
                file.set_len(0)?;
            }
            file.set_len(len as u64)?;
        }

        let base = unsafe {
            mmap(
                None,
                nz_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| DeviceError::Io(e.into()))?;

        info!(path = %path.display(), num_blocks, "mapped backing image");
        Ok(Self { base: base.cast(), len, num_blocks, path, _file: file })
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset_of(&self, pbid: u64) -> Result<usize, DeviceError> {
        if pbid >= self.num_blocks {
            return Err(DeviceError::OutOfRange { pbid, num_blocks: self.num_blocks });
        }
        Ok(pbid as usize * BLOCK_SIZE)
    }

    pub fn read_block(&self, pbid: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        if out.len() != BLOCK_SIZE {
            return Err(DeviceError::Storage("bad read buffer length"));
        }
        let off = self.offset_of(pbid)?;
        unsafe {
            ptr::copy_nonoverlapping(
                (self.base.as_ptr() as *const u8).add(off),
                out.as_mut_ptr(),
                BLOCK_SIZE,
            );
        }
        Ok(())
    }

    pub fn write_block(&self, pbid: u64, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() != BLOCK_SIZE {
            return Err(DeviceError::Storage("bad write payload length"));
        }
        let off = self.offset_of(pbid)?;
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.base.as_ptr() as *mut u8).add(off),
                BLOCK_SIZE,
            );
        }
        Ok(())
    }
}

impl Drop for MappedStorage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            warn!(path = %self.path.display(), error = %e, "munmap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let storage = MappedStorage::open(&path, 4).unwrap();
        assert_eq!(storage.num_blocks(), 4);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * BLOCK_SIZE as u64);

        let mut buf = vec![0xFFu8; BLOCK_SIZE];
        storage.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MappedStorage::open(dir.path().join("dev.img"), 8).unwrap();
        let data = vec![0x5Au8; BLOCK_SIZE];
        storage.write_block(5, &data).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        storage.read_block(5, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn persists_across_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        {
            let storage = MappedStorage::open(&path, 2).unwrap();
            storage.write_block(1, &vec![0xAAu8; BLOCK_SIZE]).unwrap();
        }
        let storage = MappedStorage::open(&path, 2).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        storage.read_block(1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn wrong_sized_image_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, b"stale").unwrap();
        let storage = MappedStorage::open(&path, 2).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * BLOCK_SIZE as u64);
        drop(storage);
    }

    #[test]
    fn out_of_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MappedStorage::open(dir.path().join("dev.img"), 2).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(matches!(
            storage.read_block(2, &mut buf),
            Err(DeviceError::OutOfRange { pbid: 2, .. })
        ));
    }
}
