use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fcache::{CachePolicy, FcacheError, FileCache, FileServer, CHUNK_SIZE};
use parking_lot::Mutex;

/// In-memory file server with a write log.
#[derive(Default)]
struct MockServer {
    state: Mutex<MockState>,
    short_writes: AtomicBool,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    open: HashMap<u64, String>,
    contents: HashMap<String, Vec<u8>>,
    write_log: Vec<(u64, u64, usize)>,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::default()
    }

    fn write_count(&self) -> usize {
        self.state.lock().write_log.len()
    }

    fn contents_of(&self, path: &str) -> Vec<u8> {
        self.state.lock().contents.get(path).cloned().unwrap_or_default()
    }
}

impl FileServer for MockServer {
    fn open(&self, path: &str, _flags: u32) -> Result<u64, FcacheError> {
        let mut st = self.state.lock();
        st.next_handle += 1;
        let handle = st.next_handle;
        st.open.insert(handle, path.to_string());
        st.contents.entry(path.to_string()).or_default();
        Ok(handle)
    }

    fn create(&self, path: &str, _mode: u32, flags: u32) -> Result<u64, FcacheError> {
        self.open(path, flags)
    }

    fn read_at(&self, handle: u64, offset: u64, size: u64) -> Result<Vec<u8>, FcacheError> {
        let st = self.state.lock();
        let path = st.open.get(&handle).ok_or(FcacheError::BadHandle(handle))?;
        let data = st.contents.get(path).cloned().unwrap_or_default();
        let start = (offset as usize).min(data.len());
        let end = (offset as usize + size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_at(&self, handle: u64, offset: u64, data: &[u8]) -> Result<u64, FcacheError> {
        if self.short_writes.load(Ordering::Relaxed) {
            return Ok(data.len() as u64 / 2);
        }
        let mut st = self.state.lock();
        let path = st.open.get(&handle).cloned().ok_or(FcacheError::BadHandle(handle))?;
        let file = st.contents.entry(path).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        st.write_log.push((handle, offset, data.len()));
        Ok(data.len() as u64)
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), FcacheError> {
        let mut st = self.state.lock();
        let file = st.contents.entry(path.to_string()).or_default();
        file.resize(size as usize, 0);
        Ok(())
    }

    fn release(&self, handle: u64) -> Result<(), FcacheError> {
        self.state.lock().open.remove(&handle);
        Ok(())
    }
}

fn lazy_policy() -> CachePolicy {
    // interval long enough that the background writer stays out of the way
    CachePolicy {
        threshold: 1 << 40,
        low_water: 1 << 39,
        interval: Duration::from_secs(3600),
    }
}

fn cache(server: &Arc<MockServer>, dir: &tempfile::TempDir) -> FileCache {
    FileCache::new(server.clone(), dir.path().join("staging"), false, lazy_policy()).unwrap()
}

#[test]
fn dirty_count_tracks_first_touch_per_chunk() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&server, &dir);

    let h = cache.create("/data/file", 0o644, 0).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 0);

    // two writes in chunk 0: one increment
    cache.write(h, 0, &[1u8; 128]).unwrap();
    cache.write(h, 4096, &[2u8; 128]).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 1);

    // a straddling write dirties chunks 1 and 2 at once
    cache.write(h, 2 * CHUNK_SIZE - 64, &[3u8; 128]).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 3);

    // flush drains chunk by chunk
    cache.flush(h).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 0);
    assert_eq!(server.write_count(), 3);

    // no dirty chunks left: release flushes nothing further
    cache.release(h).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 0);
}

#[test]
fn release_flushes_then_zeroes_dirty_count() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&server, &dir);

    let h = cache.create("/f", 0o644, 0).unwrap();
    let payload = vec![0x7Eu8; CHUNK_SIZE as usize + 10];
    cache.write(h, 0, &payload).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 2);
    assert_eq!(server.write_count(), 0);

    cache.release(h).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 0);
    assert_eq!(server.contents_of("/f"), payload);

    // the handle is gone afterwards
    assert!(matches!(
        cache.read(h, 0, 8),
        Err(FcacheError::BadHandle(_))
    ));
}

#[test]
fn read_returns_prior_writes() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&server, &dir);

    let h = cache.create("/ryw", 0o644, 0).unwrap();
    cache.write(h, 100, b"hello bfs").unwrap();
    let got = cache.read(h, 100, 9).unwrap();
    assert_eq!(got, b"hello bfs");

    // the server never saw the write
    assert_eq!(server.write_count(), 0);
}

#[test]
fn background_writer_drains_congestion() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let policy = CachePolicy {
        threshold: 10,
        low_water: 8,
        interval: Duration::from_millis(50),
    };
    let cache = FileCache::new(
        server.clone(),
        dir.path().join("staging"),
        false,
        policy,
    )
    .unwrap();

    let h = cache.create("/big", 0o644, 0).unwrap();
    // 12 distinct chunks, written sparsely (one byte each)
    for chunk in 0..12u64 {
        cache.write(h, chunk * CHUNK_SIZE, &[chunk as u8; 64]).unwrap();
    }
    assert!(cache.total_dirty_chunks() >= 10);

    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.total_dirty_chunks() >= 8 {
        assert!(Instant::now() < deadline, "background writer never drained");
        thread::sleep(Duration::from_millis(20));
    }
    assert!(cache.total_dirty_chunks() < 8);
    assert!(server.write_count() >= 4);

    cache.release(h).unwrap();
    assert_eq!(cache.total_dirty_chunks(), 0);
}

#[test]
fn congestion_drains_across_multiple_handles() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let policy = CachePolicy {
        threshold: 8,
        low_water: 4,
        interval: Duration::from_millis(50),
    };
    let cache = FileCache::new(
        server.clone(),
        dir.path().join("staging"),
        false,
        policy,
    )
    .unwrap();

    let handles: Vec<u64> = (0..3)
        .map(|i| cache.create(&format!("/multi/{i}"), 0o644, 0).unwrap())
        .collect();
    for &h in &handles {
        for chunk in 0..3u64 {
            cache.write(h, chunk * CHUNK_SIZE, &[h as u8; 32]).unwrap();
        }
    }
    assert_eq!(cache.total_dirty_chunks(), 9);

    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.total_dirty_chunks() >= 4 {
        assert!(Instant::now() < deadline, "congestion never drained");
        thread::sleep(Duration::from_millis(20));
    }

    for h in handles {
        cache.release(h).unwrap();
    }
    assert_eq!(cache.total_dirty_chunks(), 0);
}

#[test]
fn poisoned_cache_rejects_foreground_ops() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let policy = CachePolicy {
        threshold: 2,
        low_water: 1,
        interval: Duration::from_millis(30),
    };
    let cache = FileCache::new(
        server.clone(),
        dir.path().join("staging"),
        false,
        policy,
    )
    .unwrap();

    let h = cache.create("/poison", 0o644, 0).unwrap();
    server.short_writes.store(true, Ordering::Relaxed);
    for chunk in 0..3u64 {
        cache.write(h, chunk * CHUNK_SIZE, &[1u8; 16]).unwrap();
    }

    // the background writer trips over the short write and poisons the cache
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match cache.write(h, 0, &[2u8; 16]) {
            Err(FcacheError::WriterFailed) => break,
            Ok(_) => {
                assert!(Instant::now() < deadline, "cache never poisoned");
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
}

#[test]
fn short_write_during_flush_is_fatal() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&server, &dir);

    let h = cache.create("/short", 0o644, 0).unwrap();
    cache.write(h, 0, &[9u8; 512]).unwrap();
    server.short_writes.store(true, Ordering::Relaxed);

    assert!(matches!(
        cache.flush(h),
        Err(FcacheError::ShortWrite { .. })
    ));
}

#[test]
fn truncate_shrinks_staging_file() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&server, &dir);

    let h = cache.create("/t", 0o644, 0).unwrap();
    cache.write(h, 0, &[1u8; 4096]).unwrap();
    cache.truncate("/t", 100).unwrap();

    let got = cache.read(h, 0, 4096).unwrap();
    assert_eq!(got.len(), 100);
    assert_eq!(server.contents_of("/t").len(), 100);

    cache.release(h).unwrap();
}

#[test]
fn direct_io_passes_straight_through() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::new(
        server.clone(),
        dir.path().join("staging"),
        true,
        CachePolicy::default(),
    )
    .unwrap();

    let h = cache.create("/d", 0o644, 0).unwrap();
    cache.write(h, 0, b"direct").unwrap();
    assert_eq!(server.write_count(), 1);
    assert_eq!(cache.total_dirty_chunks(), 0);
    assert_eq!(cache.read(h, 0, 6).unwrap(), b"direct");
    cache.release(h).unwrap();
}

#[test]
fn concurrent_read_write_never_tears_within_a_chunk() {
    let server = MockServer::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(cache(&server, &dir));

    let h = cache.create("/torn", 0o644, 0).unwrap();
    let len = 64 * 1024usize;
    cache.write(h, 0, &vec![0xAAu8; len]).unwrap();

    let writer = {
        let cache = cache.clone();
        thread::spawn(move || {
            for i in 0..100u32 {
                let byte = if i % 2 == 0 { 0xBB } else { 0xAA };
                cache.write(h, 0, &vec![byte; len]).unwrap();
            }
        })
    };

    for _ in 0..100 {
        let got = cache.read(h, 0, len as u64).unwrap();
        assert_eq!(got.len(), len);
        let first = got[0];
        assert!(first == 0xAA || first == 0xBB);
        assert!(got.iter().all(|&b| b == first), "torn read observed");
    }

    writer.join().unwrap();
    cache.release(h).unwrap();
}
