use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use device::{Block, BlockDevice, DeviceError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::{AllocTable, BlockAddr, BlockCache, ClusterError, PhysBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDiscipline {
    /// Devices own consecutive virtual ranges in configuration order.
    Linear,
    /// Round-robin across devices; requires uniform device geometry.
    Interleave,
}

/// Outcome marker for single-block operations: `CacheHit` on a read served
/// from cache, or on a write that displaced an existing entry for the same
/// virtual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    CacheHit,
}

struct Inner {
    table: AllocTable,
    cache: Option<BlockCache>,
}

/// The virtual block cluster: one flat 4 KiB-block address space over a set
/// of devices, with an optional write-back cache in front of them.
pub struct VertBlockCluster {
    devices: Vec<Arc<dyn BlockDevice>>,
    /// Cumulative first-vbid per device, linear discipline only.
    prefix: Vec<u64>,
    discipline: AllocDiscipline,
    total_blocks: u64,
    inner: Mutex<Inner>,
    errored: AtomicBool,
}

impl VertBlockCluster {
    /// Assemble the cluster from attached devices. Geometry comes from the
    /// devices themselves (remote ones have already answered `GET_TOPO`).
    /// `cache_blocks = None` disables caching.
    pub fn open(
        devices: Vec<Arc<dyn BlockDevice>>,
        discipline: AllocDiscipline,
        cache_blocks: Option<usize>,
    ) -> Result<Self, ClusterError> {
        if devices.is_empty() {
            return Err(ClusterError::Config("no devices"));
        }
        if discipline == AllocDiscipline::Interleave {
            let first = devices[0].num_blocks();
            if devices.iter().any(|d| d.num_blocks() != first) {
                return Err(ClusterError::Config(
                    "interleave requires uniform device geometry",
                ));
            }
        }

        let mut prefix = Vec::with_capacity(devices.len());
        let mut total = 0u64;
        for dev in &devices {
            prefix.push(total);
            total = total
                .checked_add(dev.num_blocks())
                .ok_or(ClusterError::Config("address space overflow"))?;
        }
        if total == 0 {
            return Err(ClusterError::Config("empty address space"));
        }

        let ndev = devices.len() as u64;
        let table = match discipline {
            AllocDiscipline::Linear => {
                let prefix = prefix.clone();
                AllocTable::build(total, move |v| {
                    let idx = match prefix.binary_search(&v) {
                        Ok(i) => i,
                        Err(i) => i - 1,
                    };
                    BlockAddr { dev_idx: idx, pbid: v - prefix[idx] }
                })
            }
            AllocDiscipline::Interleave => AllocTable::build(total, move |v| BlockAddr {
                dev_idx: (v % ndev) as usize,
                pbid: v / ndev,
            }),
        };

        let cache = match cache_blocks {
            Some(capacity) => Some(BlockCache::new(capacity)?),
            None => None,
        };

        info!(
            devices = devices.len(),
            total_blocks = total,
            ?discipline,
            cached = cache.is_some(),
            "block cluster assembled"
        );
        Ok(Self {
            devices,
            prefix,
            discipline,
            total_blocks: total,
            inner: Mutex::new(Inner { table, cache }),
            errored: AtomicBool::new(false),
        })
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.inner.lock().cache.as_ref().map_or(0.0, BlockCache::hit_rate)
    }

    /// Resolve a virtual block id to `(device index, physical block id)`.
    pub fn map(&self, vbid: u64) -> Result<BlockAddr, ClusterError> {
        if vbid >= self.total_blocks {
            return Err(ClusterError::UnmappableAddress { vbid, total: self.total_blocks });
        }
        Ok(match self.discipline {
            AllocDiscipline::Linear => {
                let idx = match self.prefix.binary_search(&vbid) {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                BlockAddr { dev_idx: idx, pbid: vbid - self.prefix[idx] }
            }
            AllocDiscipline::Interleave => {
                let ndev = self.devices.len() as u64;
                BlockAddr { dev_idx: (vbid % ndev) as usize, pbid: vbid / ndev }
            }
        })
    }

    fn check_admission(&self) -> Result<(), ClusterError> {
        if self.errored.load(Ordering::Relaxed) {
            return Err(ClusterError::Errored);
        }
        Ok(())
    }

    /// Flush-before-destroy for an entry displaced from the cache. A flush
    /// failure halts the cluster. Returns the displaced key, if any.
    fn retire(&self, displaced: Option<(u64, PhysBlock)>) -> Result<Option<u64>, ClusterError> {
        let Some((vbid, mut blk)) = displaced else {
            return Ok(None);
        };
        if blk.dirty() {
            if let Err(e) = blk.flush() {
                self.errored.store(true, Ordering::Relaxed);
                error!(vbid, error = %e, "eviction flush failed, halting cluster");
                return Err(ClusterError::CacheFlush(e));
            }
            debug!(vbid, pbid = blk.pbid(), "flushed dirty block on eviction");
        }
        Ok(Some(vbid))
    }

    /// Read one virtual block, serving from cache when possible.
    pub fn read_block(&self, vbid: u64) -> Result<(Block, BlockStatus), ClusterError> {
        self.check_admission()?;
        let addr = self.map(vbid)?;
        let dev = &self.devices[addr.dev_idx];

        let mut inner = self.inner.lock();
        if let Some(cache) = inner.cache.as_mut() {
            if let Some(hit) = cache.get(vbid) {
                trace!(vbid, "cache hit");
                return Ok((hit.data.clone(), BlockStatus::CacheHit));
            }
        }

        let mut blk = Block::zeroed();
        dev.get_block(addr.pbid, &mut blk)?;
        trace!(vbid, pbid = addr.pbid, did = dev.device_id(), "fetched block");

        if let Some(cache) = inner.cache.as_mut() {
            let entry = PhysBlock::new(blk.clone(), addr.pbid, dev.clone(), false);
            let displaced = cache.insert(vbid, entry);
            self.retire(displaced)?;
        }
        Ok((blk, BlockStatus::Ok))
    }

    /// Write one virtual block. With caching enabled and `sync` unset the
    /// write is deferred until eviction or an explicit flush; otherwise it
    /// goes to the device immediately.
    pub fn write_block(
        &self,
        vbid: u64,
        data: Block,
        sync: bool,
    ) -> Result<BlockStatus, ClusterError> {
        self.check_admission()?;
        let addr = self.map(vbid)?;
        let dev = self.devices[addr.dev_idx].clone();

        let mut inner = self.inner.lock();
        inner.table.touch(vbid);

        let cached = inner.cache.is_some();
        let write_through = sync || !cached;
        let mut status = BlockStatus::Ok;

        if let Some(cache) = inner.cache.as_mut() {
            let entry = PhysBlock::new(data.clone(), addr.pbid, dev.clone(), !write_through);
            let displaced = cache.insert(vbid, entry);
            if self.retire(displaced)? == Some(vbid) {
                status = BlockStatus::CacheHit;
            }
        }

        if write_through {
            dev.put_block(addr.pbid, &data)?;
            trace!(vbid, pbid = addr.pbid, "wrote through");
        } else {
            trace!(vbid, pbid = addr.pbid, "write deferred");
        }
        Ok(status)
    }

    /// Bulk read: one `GET_BLOCKS` per owning device, cache bypassed.
    /// Results come back in request order.
    pub fn read_blocks(&self, vbids: &[u64]) -> Result<Vec<(u64, Block)>, ClusterError> {
        self.check_admission()?;

        let mut per_dev: Vec<Vec<(u64, u64)>> = vec![Vec::new(); self.devices.len()];
        for &vbid in vbids {
            let addr = self.map(vbid)?;
            per_dev[addr.dev_idx].push((vbid, addr.pbid));
        }

        let mut merged: HashMap<u64, Block> = HashMap::with_capacity(vbids.len());
        for (idx, want) in per_dev.iter().enumerate() {
            if want.is_empty() {
                continue;
            }
            let pbids: Vec<u64> = want.iter().map(|(_, p)| *p).collect();
            let got = self.devices[idx].get_blocks(&pbids)?;
            for ((vbid, _), (_, blk)) in want.iter().zip(got) {
                merged.insert(*vbid, blk);
            }
        }

        vbids
            .iter()
            .map(|v| {
                merged
                    .get(v)
                    .cloned()
                    .map(|b| (*v, b))
                    .ok_or(ClusterError::Device(DeviceError::Protocol(
                        "bulk merge missed a block",
                    )))
            })
            .collect()
    }

    /// Bulk write: one `PUT_BLOCKS` per owning device, cache bypassed.
    pub fn write_blocks(&self, blocks: &[(u64, Block)]) -> Result<(), ClusterError> {
        self.check_admission()?;

        let mut per_dev: Vec<Vec<(u64, Block)>> = vec![Vec::new(); self.devices.len()];
        {
            let mut inner = self.inner.lock();
            for (vbid, data) in blocks {
                let addr = self.map(*vbid)?;
                inner.table.touch(*vbid);
                per_dev[addr.dev_idx].push((addr.pbid, data.clone()));
            }
        }

        for (idx, set) in per_dev.iter().enumerate() {
            if set.is_empty() {
                continue;
            }
            self.devices[idx].put_blocks(set)?;
        }
        Ok(())
    }

    /// Synchronously write back every dirty cached block.
    pub fn flush(&self) -> Result<(), ClusterError> {
        self.check_admission()?;
        let mut inner = self.inner.lock();
        let Some(cache) = inner.cache.as_mut() else {
            return Ok(());
        };
        for (vbid, blk) in cache.iter_mut() {
            if blk.dirty() {
                if let Err(e) = blk.flush() {
                    self.errored.store(true, Ordering::Relaxed);
                    error!(vbid, error = %e, "flush failed, halting cluster");
                    return Err(ClusterError::CacheFlush(e));
                }
            }
        }
        Ok(())
    }
}
