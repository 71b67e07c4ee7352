//! Block id to block mapping index.
//!
//! Updated mappings are staged in a write-back cache and become persistent
//! only after every container they reference is committed: the background
//! committer moves such mappings through the ready queue into the
//! persistent back-end. Reads always see the freshest staged state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bds_api_types::BlockIndexConfig;
use bds_index::Index;
use bds_tools::lru_cache::LruCache;

use crate::block_locks::{BlockLockGuard, BlockLocks};
use crate::block_mapping::BlockMapping;
use crate::chunk_store::{ChunkStore, CommitState};
use crate::error::{DedupError, Result};
use crate::log_store::{LogConsumer, LogEvent};
use crate::EMPTY_DATA_ADDRESS;

#[derive(Default)]
pub struct BlockIndexStat {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub imported: AtomicU64,
    pub deletes: AtomicU64,
}

impl BlockIndexStat {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "reads": self.reads.load(Ordering::Relaxed),
            "writes": self.writes.load(Ordering::Relaxed),
            "imported": self.imported.load(Ordering::Relaxed),
            "deletes": self.deletes.load(Ordering::Relaxed),
        })
    }
}

struct BlockIndexInner {
    persistent: Arc<dyn Index>,
    dirty: Mutex<HashMap<u64, BlockMapping>>,
    read_cache: Mutex<LruCache<u64, BlockMapping>>,
    ready: Mutex<VecDeque<u64>>,
    locks: BlockLocks,
    store: Arc<ChunkStore>,
    stats: BlockIndexStat,
    stop: AtomicBool,
    check_interval: Duration,
}

pub struct BlockIndex {
    inner: Arc<BlockIndexInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn block_key(block_id: u64) -> [u8; 8] {
    block_id.to_be_bytes()
}

impl BlockIndexInner {
    fn persisted_version(&self, block_id: u64) -> Result<Option<u32>> {
        match self.persistent.lookup(&block_key(block_id))? {
            None => Ok(None),
            Some(payload) => {
                let mapping: BlockMapping = serde_json::from_slice(&payload).map_err(|err| {
                    DedupError::integrity(format!("block index entry {block_id} undecodable: {err}"))
                })?;
                Ok(Some(mapping.version))
            }
        }
    }

    fn is_ready(&self, mapping: &BlockMapping) -> Result<bool> {
        for item in &mapping.items {
            if item.data_address == EMPTY_DATA_ADDRESS {
                continue;
            }
            match self.store.is_committed(item.data_address)? {
                CommitState::Committed => {}
                CommitState::NotCommitted => return Ok(false),
                CommitState::WillNeverCommit => {
                    return Err(DedupError::integrity(format!(
                        "block {} references container {} that will never commit",
                        mapping.block_id, item.data_address
                    )))
                }
            }
        }
        Ok(true)
    }

    /// Move ready dirty mappings into the ready queue.
    fn check_ready(&self) -> Result<usize> {
        let candidates: Vec<u64> = {
            let ready = self.ready.lock().unwrap();
            self.dirty
                .lock()
                .unwrap()
                .keys()
                .filter(|block_id| !ready.contains(block_id))
                .copied()
                .collect()
        };
        let mut queued = 0;
        for block_id in candidates {
            let mapping = match self.dirty.lock().unwrap().get(&block_id) {
                Some(mapping) => mapping.clone(),
                None => continue,
            };
            match self.is_ready(&mapping) {
                Ok(true) => {
                    self.ready.lock().unwrap().push_back(block_id);
                    queued += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    // a mapping whose write failed stays dirty; the failed
                    // write path rewrites it
                    log::warn!("ready check for block {block_id} failed - {err}");
                }
            }
        }
        Ok(queued)
    }

    /// Drain the ready queue into the persistent back-end.
    fn drain_ready(&self) -> Result<usize> {
        let mut imported = 0;
        loop {
            let block_id = match self.ready.lock().unwrap().pop_front() {
                Some(block_id) => block_id,
                None => break,
            };
            let mapping = match self.dirty.lock().unwrap().get(&block_id) {
                Some(mapping) => mapping.clone(),
                None => continue, // deleted or superseded meanwhile
            };
            if !self.is_ready(&mapping).unwrap_or(false) {
                continue; // superseded by a newer, not yet committed write
            }
            let payload = serde_json::to_vec(&mapping)
                .map_err(|err| DedupError::programming(format!("mapping encode: {err}")))?;
            self.persistent.put(&block_key(block_id), &payload)?;
            // drop the dirty entry only if it was not overwritten again
            let mut dirty = self.dirty.lock().unwrap();
            if dirty.get(&block_id).map(|entry| entry.version) == Some(mapping.version) {
                dirty.remove(&block_id);
            }
            drop(dirty);
            self.read_cache.lock().unwrap().insert(block_id, mapping);
            imported += 1;
        }
        if imported > 0 {
            self.stats.imported.fetch_add(imported as u64, Ordering::Relaxed);
        }
        Ok(imported)
    }
}

impl BlockIndex {
    pub fn new(config: &BlockIndexConfig, store: Arc<ChunkStore>) -> Result<Self> {
        let persistent =
            crate::index_factory::open_index(&config.persistent).map_err(DedupError::Other)?;
        Ok(Self {
            inner: Arc::new(BlockIndexInner {
                persistent,
                dirty: Mutex::new(HashMap::new()),
                read_cache: Mutex::new(LruCache::new(config.cache_size)),
                ready: Mutex::new(VecDeque::new()),
                locks: BlockLocks::new(config.block_lock_count),
                store,
                stats: BlockIndexStat::default(),
                stop: AtomicBool::new(false),
                check_interval: Duration::from_millis(config.bg_check_interval_ms),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn locks(&self) -> &BlockLocks {
        &self.inner.locks
    }

    pub fn stats(&self) -> &BlockIndexStat {
        &self.inner.stats
    }

    fn check_guard(guard: &BlockLockGuard, block_id: u64) -> Result<()> {
        if !guard.covers(block_id) {
            return Err(DedupError::programming(
                "block lock guard does not cover the block id",
            ));
        }
        Ok(())
    }

    /// Current mapping of the block; a never-written block reads as one
    /// slice of the empty chunk.
    pub fn read_mapping(
        &self,
        block_id: u64,
        block_size: usize,
        guard: &BlockLockGuard,
    ) -> Result<BlockMapping> {
        Self::check_guard(guard, block_id)?;
        self.inner.stats.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(mapping) = self.inner.dirty.lock().unwrap().get(&block_id) {
            return Ok(mapping.clone());
        }
        if let Some(mapping) = self.inner.read_cache.lock().unwrap().get_mut(&block_id) {
            return Ok(mapping.clone());
        }
        match self.inner.persistent.lookup(&block_key(block_id))? {
            Some(payload) => {
                let mapping: BlockMapping = serde_json::from_slice(&payload).map_err(|err| {
                    DedupError::integrity(format!(
                        "block index entry {block_id} undecodable: {err}"
                    ))
                })?;
                self.inner.read_cache.lock().unwrap().insert(block_id, mapping.clone());
                Ok(mapping)
            }
            None => Ok(BlockMapping::new(block_id, block_size)),
        }
    }

    /// Stage an updated mapping; it migrates to the persistent back-end
    /// once all referenced containers are committed.
    pub fn store_mapping(&self, mapping: BlockMapping, guard: &BlockLockGuard) -> Result<()> {
        Self::check_guard(guard, mapping.block_id)?;
        if !mapping.check() {
            return Err(DedupError::programming(format!(
                "mapping for block {} does not cover the block",
                mapping.block_id
            )));
        }
        self.inner.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.read_cache.lock().unwrap().remove(&mapping.block_id);
        self.inner.dirty.lock().unwrap().insert(mapping.block_id, mapping);
        Ok(())
    }

    pub fn delete_mapping(&self, block_id: u64, guard: &BlockLockGuard) -> Result<()> {
        Self::check_guard(guard, block_id)?;
        self.inner.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.dirty.lock().unwrap().remove(&block_id);
        self.inner.read_cache.lock().unwrap().remove(&block_id);
        self.inner.persistent.delete(&block_key(block_id))?;
        Ok(())
    }

    pub fn dirty_item_count(&self) -> usize {
        self.inner.dirty.lock().unwrap().len()
    }

    /// One foreground committer pass, for tests and shutdown.
    pub fn import_ready(&self) -> Result<usize> {
        self.inner.check_ready()?;
        self.inner.drain_ready()
    }

    pub fn run(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("block-index-bg".into())
            .spawn(move || {
                while !inner.stop.load(Ordering::Acquire) {
                    let queued = inner.check_ready().unwrap_or_else(|err| {
                        log::error!("block index ready check failed - {err}");
                        0
                    });
                    let imported = inner.drain_ready().unwrap_or_else(|err| {
                        log::error!("block index import failed - {err}");
                        0
                    });
                    if queued == 0 && imported == 0 {
                        std::thread::sleep(inner.check_interval);
                    }
                }
            })
            .unwrap();
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// The log consumer restoring staged mappings during dirty-start
    /// replay. Register it before `OperationLog::start`.
    pub fn log_consumer(&self) -> Arc<dyn LogConsumer> {
        Arc::new(BlockIndexLogConsumer {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Drop recovered mappings that reference containers lost in a crash.
    /// Such mappings lie beyond the recoverable prefix of the log; the
    /// previously persisted block state stays in effect. Call once after
    /// dirty-start replay finished.
    pub fn drop_unrecoverable(&self) -> Result<usize> {
        let block_ids: Vec<u64> = self.inner.dirty.lock().unwrap().keys().copied().collect();
        let mut dropped = 0;
        for block_id in block_ids {
            let mapping = match self.inner.dirty.lock().unwrap().get(&block_id) {
                Some(mapping) => mapping.clone(),
                None => continue,
            };
            let mut lost = false;
            for item in &mapping.items {
                if item.data_address == EMPTY_DATA_ADDRESS {
                    continue;
                }
                if self.inner.store.is_committed(item.data_address)?
                    == CommitState::WillNeverCommit
                {
                    lost = true;
                    break;
                }
            }
            if lost {
                log::warn!(
                    "dropping unrecoverable mapping for block {block_id} (version {})",
                    mapping.version
                );
                self.inner.dirty.lock().unwrap().remove(&block_id);
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Stop the background committer, draining the ready queue to
    /// completion (stop-mode import).
    pub fn stop(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| DedupError::programming("block index worker panicked"))?;
        }
        loop {
            self.inner.check_ready()?;
            if self.inner.drain_ready()? == 0 {
                break;
            }
        }
        self.inner.persistent.sync()?;
        Ok(())
    }
}

struct BlockIndexLogConsumer {
    inner: std::sync::Weak<BlockIndexInner>,
}

impl LogConsumer for BlockIndexLogConsumer {
    fn replay_dirty_start(&self, log_id: u64, event: &LogEvent) -> Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        match event {
            LogEvent::BlockMappingWritten { pair } => {
                let mapping = pair.modified_mapping(log_id);
                let block_id = mapping.block_id;
                let staged_version = inner
                    .dirty
                    .lock()
                    .unwrap()
                    .get(&block_id)
                    .map(|entry| entry.version);
                let known_version = match staged_version {
                    Some(version) => Some(version),
                    None => inner.persisted_version(block_id)?,
                };
                // replay is in log order; an older or equal version means
                // this transition already took effect
                if known_version.map_or(true, |version| mapping.version > version) {
                    inner.read_cache.lock().unwrap().remove(&block_id);
                    inner.dirty.lock().unwrap().insert(block_id, mapping);
                }
            }
            LogEvent::BlockMappingDeleted { pair } => {
                let block_id = pair.block_id;
                inner.dirty.lock().unwrap().remove(&block_id);
                inner.read_cache.lock().unwrap().remove(&block_id);
                inner.persistent.delete(&block_key(block_id))?;
            }
            _ => {}
        }
        Ok(())
    }
}
