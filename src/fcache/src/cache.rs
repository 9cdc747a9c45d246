use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::writer::{spawn_writer, WriterHandle};
use crate::{FcacheError, FileServer, CHUNK_SIZE};

/// Write-back tuning. The defaults implement the 1 GiB congestion window:
/// flushing starts at 1024 dirty chunks and stops below 80% of that.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub threshold: u64,
    pub low_water: u64,
    pub interval: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        let threshold = (1u64 << 30) / CHUNK_SIZE;
        Self {
            threshold,
            low_water: threshold * 4 / 5,
            interval: Duration::from_secs(5),
        }
    }
}

pub(crate) struct StagingFile {
    pub file: File,
    pub staging_path: PathBuf,
    pub remote_path: String,
    pub dirty: BTreeSet<u64>,
}

pub(crate) struct Tables {
    pub files: HashMap<u64, StagingFile>,
    pub total_dirty: u64,
}

/// Per-client write-back file cache.
///
/// Every open server handle gets a staging file under a private directory;
/// writes land there and are tracked per 1 MiB chunk. Dirty chunks reach the
/// server on `flush`/`fsync`/`release`, or earlier when the background writer
/// sees the process-wide dirty count cross the congestion threshold. One
/// rw-lock covers the tables and all staging files: foreground reads take it
/// shared, anything that mutates takes it exclusive.
pub struct FileCache {
    server: Arc<dyn FileServer>,
    cache_dir: PathBuf,
    direct_io: bool,
    tables: Arc<RwLock<Tables>>,
    poisoned: Arc<AtomicBool>,
    writer: Option<WriterHandle>,
}

impl FileCache {
    pub fn new(
        server: Arc<dyn FileServer>,
        cache_dir: impl Into<PathBuf>,
        direct_io: bool,
        policy: CachePolicy,
    ) -> Result<Self, FcacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;

        let tables = Arc::new(RwLock::new(Tables {
            files: HashMap::new(),
            total_dirty: 0,
        }));
        let poisoned = Arc::new(AtomicBool::new(false));

        let writer = if direct_io {
            None
        } else {
            Some(spawn_writer(
                tables.clone(),
                server.clone(),
                policy.clone(),
                poisoned.clone(),
            )?)
        };

        info!(dir = %cache_dir.display(), direct_io, "client file cache ready");
        Ok(Self { server, cache_dir, direct_io, tables, poisoned, writer })
    }

    /// Process-wide dirty chunk count.
    pub fn total_dirty_chunks(&self) -> u64 {
        self.tables.read().total_dirty
    }

    fn check_usable(&self) -> Result<(), FcacheError> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(FcacheError::WriterFailed);
        }
        Ok(())
    }

    fn staging_path(&self, remote_path: &str) -> PathBuf {
        self.cache_dir.join(remote_path.trim_start_matches('/'))
    }

    fn add_entry(&self, handle: u64, remote_path: &str) -> Result<(), FcacheError> {
        let staging_path = self.staging_path(remote_path);
        if let Some(parent) = staging_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)?;

        let mut tables = self.tables.write();
        tables.files.insert(
            handle,
            StagingFile {
                file,
                staging_path,
                remote_path: remote_path.to_string(),
                dirty: BTreeSet::new(),
            },
        );
        debug!(handle, path = remote_path, "staging file attached");
        Ok(())
    }

    pub fn open(&self, path: &str, flags: u32) -> Result<u64, FcacheError> {
        self.check_usable()?;
        let handle = self.server.open(path, flags)?;
        if !self.direct_io {
            self.add_entry(handle, path)?;
        }
        Ok(handle)
    }

    pub fn create(&self, path: &str, mode: u32, flags: u32) -> Result<u64, FcacheError> {
        self.check_usable()?;
        let handle = self.server.create(path, mode, flags)?;
        if !self.direct_io {
            self.add_entry(handle, path)?;
        }
        Ok(handle)
    }

    /// Read through the staging file. Writes always precede reads through
    /// this cache, so the staging file is the handle's source of truth.
    pub fn read(&self, handle: u64, offset: u64, size: u64) -> Result<Vec<u8>, FcacheError> {
        self.check_usable()?;
        if self.direct_io {
            return self.server.read_at(handle, offset, size);
        }

        let tables = self.tables.read();
        let entry = tables.files.get(&handle).ok_or(FcacheError::BadHandle(handle))?;
        let mut buf = vec![0u8; size as usize];
        let n = read_full_at(&entry.file, &mut buf, offset)?;
        buf.truncate(n);
        trace!(handle, offset, size, got = n, "cached read");
        Ok(buf)
    }

    /// Buffer a write locally and mark the touched chunks dirty. Never
    /// contacts the server.
    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> Result<u64, FcacheError> {
        self.check_usable()?;
        if self.direct_io {
            return self.server.write_at(handle, offset, data);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut tables = self.tables.write();
        let Tables { files, total_dirty } = &mut *tables;
        let entry = files.get_mut(&handle).ok_or(FcacheError::BadHandle(handle))?;
        entry.file.write_all_at(data, offset)?;

        let first = offset / CHUNK_SIZE;
        let last = (offset + data.len() as u64 - 1) / CHUNK_SIZE;
        for chunk in first..=last {
            if entry.dirty.insert(chunk) {
                *total_dirty += 1;
            }
        }
        trace!(handle, offset, len = data.len(), total_dirty = *total_dirty, "cached write");
        Ok(data.len() as u64)
    }

    /// Drain every dirty chunk of the handle to the server.
    pub fn flush(&self, handle: u64) -> Result<(), FcacheError> {
        self.check_usable()?;
        if self.direct_io {
            return Ok(());
        }
        let mut tables = self.tables.write();
        flush_chunks(&mut tables, self.server.as_ref(), handle, None)?;
        Ok(())
    }

    /// `fsync` carries the same obligation as `flush` here: everything dirty
    /// reaches the server before the call returns.
    pub fn fsync(&self, handle: u64) -> Result<(), FcacheError> {
        self.flush(handle)
    }

    /// Flush, release on the server, then drop the local entry and its
    /// staging file. The entry survives until every chunk is acknowledged.
    pub fn release(&self, handle: u64) -> Result<(), FcacheError> {
        self.check_usable()?;
        if self.direct_io {
            return self.server.release(handle);
        }

        let mut tables = self.tables.write();
        flush_chunks(&mut tables, self.server.as_ref(), handle, None)?;
        self.server.release(handle)?;
        if let Some(entry) = tables.files.remove(&handle) {
            if let Err(e) = fs::remove_file(&entry.staging_path) {
                debug!(handle, error = %e, "staging file removal failed");
            }
        }
        debug!(handle, "released");
        Ok(())
    }

    /// Truncate on the server, then mirror onto the staging file.
    pub fn truncate(&self, path: &str, size: u64) -> Result<(), FcacheError> {
        self.check_usable()?;
        self.server.truncate(path, size)?;
        if self.direct_io {
            return Ok(());
        }

        let tables = self.tables.read();
        for entry in tables.files.values() {
            if entry.remote_path == path {
                entry.file.set_len(size)?;
            }
        }
        Ok(())
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.stop();
        }
    }
}

/// Send dirty chunks of `handle` to the server, oldest chunk index first,
/// stopping after `limit` chunks when one is given. Each acknowledged chunk
/// drops the process-wide dirty count by one; a short acknowledgement is
/// fatal for the flush.
pub(crate) fn flush_chunks(
    tables: &mut Tables,
    server: &dyn FileServer,
    handle: u64,
    limit: Option<u64>,
) -> Result<u64, FcacheError> {
    let Tables { files, total_dirty } = &mut *tables;
    let entry = files.get_mut(&handle).ok_or(FcacheError::BadHandle(handle))?;

    let snapshot: Vec<u64> = entry.dirty.iter().copied().collect();
    let mut flushed = 0u64;
    for chunk in snapshot {
        if limit.is_some_and(|l| flushed >= l) {
            break;
        }
        let offset = chunk * CHUNK_SIZE;
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        let n = read_full_at(&entry.file, &mut buf, offset)?;
        if n > 0 {
            let written = server.write_at(handle, offset, &buf[..n])?;
            if written != n as u64 {
                return Err(FcacheError::ShortWrite { expected: n as u64, got: written });
            }
        }
        // chunks truncated out of the file flush as a no-op
        entry.dirty.remove(&chunk);
        *total_dirty -= 1;
        flushed += 1;
        trace!(handle, chunk, bytes = n, "chunk flushed");
    }
    Ok(flushed)
}

/// `pread` until the buffer is full or EOF; returns the bytes read.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize, FcacheError> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}
