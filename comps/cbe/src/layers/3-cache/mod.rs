// SPDX-License-Identifier: MPL-2.0

//! The layer of metadata caching.
//!
//! Inner tree nodes are read and written through an LRU [`Cache`]. Writes go
//! to the device immediately, so a block address that the free tree hands
//! out again never has a stale dirty copy pending behind it.

use core::num::NonZeroUsize;

use lru::LruCache;

use crate::{
    layers::bio::BlockSet,
    module::{ChannelPool, Module, ModuleId, ModuleRequest, Origin, SyncState},
    prelude::*,
};

/// Requests served by [`Cache`].
#[derive(Debug)]
pub enum CacheReq {
    Read { pba: Pba, data: Block },
    Write { pba: Pba, data: Block },
    /// Flushes the device below the cache.
    Sync,
}

/// The cache module.
pub struct Cache<D> {
    disk: Arc<D>,
    lru: LruCache<Pba, Block>,
    pool: ChannelPool<SyncState>,
    hits: u64,
    misses: u64,
}

impl<D: BlockSet> Cache<D> {
    pub fn new(disk: Arc<D>, capacity: usize, nr_of_channels: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            disk,
            lru: LruCache::new(capacity),
            pool: ChannelPool::new(ModuleId::Cache, nr_of_channels),
            hits: 0,
            misses: 0,
        }
    }

    pub fn read(&mut self, pba: Pba, data: &mut Block) -> Result<()> {
        if let Some(cached) = self.lru.get(&pba) {
            self.hits += 1;
            data.as_mut_slice().copy_from_slice(cached.as_slice());
            return Ok(());
        }
        self.misses += 1;
        self.disk.read(pba, data)?;
        self.lru.put(pba, data.clone());
        Ok(())
    }

    pub fn write(&mut self, pba: Pba, data: &Block) -> Result<()> {
        if let Err(err) = self.disk.write(pba, data) {
            self.lru.pop(&pba);
            return Err(err);
        }
        self.lru.put(pba, data.clone());
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        trace!(
            "[Cache] sync, {} hits / {} misses so far",
            self.hits, self.misses
        );
        self.disk.flush()
    }

    fn serve(&mut self, req: &mut CacheReq) -> Result<()> {
        match req {
            CacheReq::Read { pba, data } => self.read(*pba, data),
            CacheReq::Write { pba, data } => self.write(*pba, data),
            CacheReq::Sync => self.sync(),
        }
    }
}

impl<D: BlockSet> Module for Cache<D> {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        self.pool.insert(req, SyncState::Submitted);
    }

    fn execute(&mut self, progress: &mut bool) {
        for idx in self.pool.occupied() {
            let Some(chan) = self.pool.get_mut(idx) else {
                continue;
            };
            if chan.state != SyncState::Submitted {
                continue;
            }
            let mut payload = core::mem::replace(chan.req.payload_mut::<CacheReq>(), CacheReq::Sync);
            let result = self.serve(&mut payload);
            if let Err(err) = &result {
                warn!("[Cache] request failed: {}", err);
            }
            if let Some(chan) = self.pool.get_mut(idx) {
                *chan.req.payload_mut::<CacheReq>() = payload;
                chan.req.result = result;
                chan.state = SyncState::Completed;
            }
            *progress = true;
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_completed()
    }

    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_completed(origin)
    }
}
