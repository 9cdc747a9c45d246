use std::num::NonZeroUsize;
use std::sync::Arc;

use device::{Block, BlockDevice, DeviceError};
use lru::LruCache;

use crate::ClusterError;

/// A cached physical block: the payload plus everything needed to write it
/// back without consulting the mapping again. The device handle is the
/// back-reference that makes flush-on-eviction possible; devices keep no
/// per-block state, so no reference cycle exists.
pub struct PhysBlock {
    pub data: Block,
    pbid: u64,
    dirty: bool,
    dev: Arc<dyn BlockDevice>,
}

impl PhysBlock {
    pub fn new(data: Block, pbid: u64, dev: Arc<dyn BlockDevice>, dirty: bool) -> Self {
        Self { data, pbid, dirty, dev }
    }

    pub fn pbid(&self) -> u64 {
        self.pbid
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Write back through the owning device and mark clean.
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        if self.dirty {
            self.dev.put_block(self.pbid, &self.data)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Bounded LRU over cached physical blocks, keyed by virtual block id.
///
/// Insertion hands any displaced entry back to the caller, which owns the
/// flush-before-destroy obligation; the cache itself never drops a dirty
/// block silently.
pub struct BlockCache {
    inner: LruCache<u64, PhysBlock>,
    hits: u64,
    lookups: u64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Result<Self, ClusterError> {
        let cap = NonZeroUsize::new(capacity).ok_or(ClusterError::Config("zero cache capacity"))?;
        Ok(Self { inner: LruCache::new(cap), hits: 0, lookups: 0 })
    }

    pub fn get(&mut self, vbid: u64) -> Option<&PhysBlock> {
        self.lookups += 1;
        let hit = self.inner.get(&vbid);
        if hit.is_some() {
            self.hits += 1;
        }
        hit
    }

    /// Insert, returning the displaced entry: the previous holder of this
    /// key, or the least-recently-used entry if capacity was reached.
    pub fn insert(&mut self, vbid: u64, blk: PhysBlock) -> Option<(u64, PhysBlock)> {
        self.inner.push(vbid, blk)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / self.lookups as f64
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut PhysBlock)> {
        self.inner.iter_mut()
    }
}
