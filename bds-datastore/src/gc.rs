//! Reference counting garbage collector.
//!
//! Subscribes to the log: direct replay marks the touched fingerprints as
//! in-combat, background replay applies the usage count diffs derived
//! from each block mapping pair. Chunks whose count reaches zero become
//! candidates in a persistent index and are drained in batches during
//! idle periods; a candidate is only deleted when its lock is free, it is
//! not in combat and its count is still zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use bds_api_types::{GarbageCollectionStatus, GcConfig, GcMode};
use bds_index::Index;

use crate::chunk_index::{ChunkIndex, ChunkMapping, LookupOutcome};
use crate::error::{DedupError, Result};
use crate::fingerprint::Fingerprint;
use crate::idle_detector::IdleConsumer;
use crate::log_store::{LogConsumer, LogEvent, OperationLog};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CandidateData {
    data_address: u64,
}

struct GcInner {
    mode: GcMode,
    config: GcConfig,
    chunk_index: Arc<ChunkIndex>,
    candidates: Arc<dyn Index>,
    log: Arc<OperationLog>,
    status: Mutex<GarbageCollectionStatus>,
    paused: AtomicBool,
}

pub struct GarbageCollector {
    inner: Arc<GcInner>,
}

impl GarbageCollector {
    pub fn new(
        config: &GcConfig,
        chunk_index: Arc<ChunkIndex>,
        log: Arc<OperationLog>,
    ) -> Result<Self> {
        let candidates =
            crate::index_factory::open_index(&config.candidate_index).map_err(DedupError::Other)?;
        Ok(Self {
            inner: Arc::new(GcInner {
                mode: config.mode,
                config: config.clone(),
                chunk_index,
                candidates,
                log,
                status: Mutex::new(GarbageCollectionStatus::default()),
                paused: AtomicBool::new(false),
            }),
        })
    }

    pub fn log_consumer(&self) -> Arc<dyn LogConsumer> {
        Arc::new(GcLogConsumer {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn idle_consumer(&self) -> Arc<dyn IdleConsumer> {
        Arc::new(GcIdleConsumer {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn status(&self) -> GarbageCollectionStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn restore_status(&self, status: GarbageCollectionStatus) {
        *self.inner.status.lock().unwrap() = status;
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn candidate_count(&self) -> Result<u64> {
        Ok(self.inner.candidates.item_count()?)
    }

    /// Whether request processing should be slowed because the candidate
    /// backlog ran over its limits.
    pub fn throttle_exceeded(&self) -> Result<bool> {
        if !self.inner.config.throttle_enabled {
            return Ok(false);
        }
        Ok(self.candidate_count()? > self.inner.config.throttle_hard_limit)
    }

    /// Drain one batch of deletion candidates. Returns the number of
    /// chunks actually deleted.
    pub fn process_candidates(&self, limit: usize) -> Result<usize> {
        self.inner.process_candidates(limit)
    }
}

impl GcInner {
    fn apply_diff(&self, log_id: u64, pair: &crate::block_mapping::BlockMappingPair) -> Result<()> {
        let diff = pair.diff();
        {
            let mut status = self.status.lock().unwrap();
            status.processed_diffs += 1;
        }

        for (fingerprint, (delta, data_address)) in diff {
            if self.mode == GcMode::None {
                // hint-only mode: remember the owning block, no counting
                let guard = self.chunk_index.locks().lock(&fingerprint);
                let mut mapping = ChunkMapping::new(fingerprint);
                if self.chunk_index.lookup(&mut mapping, &guard)? == LookupOutcome::Found {
                    mapping.block_hint = Some(pair.block_id);
                    self.chunk_index.put(&mapping, &guard)?;
                }
                continue;
            }

            let guard = self.chunk_index.locks().lock(&fingerprint);
            let new_count =
                self.chunk_index
                    .change_usage_count(&fingerprint, delta, log_id, &guard)?;
            drop(guard);

            match new_count {
                None => {} // not indexed (sampling), nothing to track
                Some(0) => {
                    let data = CandidateData { data_address };
                    self.candidates
                        .put(fingerprint.as_bytes(), &serde_json::to_vec(&data).unwrap())?;
                    let mut status = self.status.lock().unwrap();
                    status.usage_count_updates += 1;
                    status.new_candidates += 1;
                }
                Some(_) => {
                    // a rewritten chunk is no longer a candidate
                    self.candidates.delete(fingerprint.as_bytes())?;
                    self.status.lock().unwrap().usage_count_updates += 1;
                }
            }
        }
        Ok(())
    }

    fn mark_in_combat(&self, pair: &crate::block_mapping::BlockMappingPair) {
        for (fingerprint, _) in pair.diff() {
            self.chunk_index.mark_in_combat(&fingerprint);
        }
    }

    fn process_candidates(&self, limit: usize) -> Result<usize> {
        if self.mode == GcMode::None || self.paused.load(Ordering::Acquire) {
            return Ok(0);
        }

        let batch: Vec<(Fingerprint, u64)> = {
            let mut iter = self.candidates.iterate()?;
            let mut out = Vec::new();
            while out.len() < limit {
                match iter.next_entry()? {
                    None => break,
                    Some((key, payload)) => {
                        let fingerprint =
                            Fingerprint::from_slice(&key).map_err(DedupError::Other)?;
                        let data: CandidateData = serde_json::from_slice(&payload)
                            .map_err(|err| {
                                DedupError::integrity(format!("bad GC candidate: {err}"))
                            })?;
                        out.push((fingerprint, data.data_address));
                    }
                }
            }
            out
        };

        // deletions per container, so orphan events can be batched
        let mut orphans: HashMap<u64, Vec<Fingerprint>> = HashMap::new();
        let mut deleted = 0;

        for (fingerprint, data_address) in batch {
            {
                let mut status = self.status.lock().unwrap();
                status.processed_candidates += 1;
            }

            if self.chunk_index.is_in_combat(&fingerprint) {
                self.status.lock().unwrap().skipped_in_combat += 1;
                continue;
            }
            let guard = match self.chunk_index.locks().try_lock(&fingerprint) {
                Some(guard) => guard,
                None => {
                    self.status.lock().unwrap().skipped_busy += 1;
                    continue;
                }
            };

            let mut mapping = ChunkMapping::new(fingerprint);
            match self.chunk_index.lookup(&mut mapping, &guard)? {
                LookupOutcome::NotFound => {
                    // stale candidate
                    self.candidates.delete(fingerprint.as_bytes())?;
                    continue;
                }
                LookupOutcome::Found => {}
            }
            if mapping.usage_count != 0 {
                self.candidates.delete(fingerprint.as_bytes())?;
                continue;
            }

            self.chunk_index.delete(&fingerprint, &guard)?;
            drop(guard);
            self.candidates.delete(fingerprint.as_bytes())?;
            orphans.entry(data_address).or_default().push(fingerprint);
            deleted += 1;
            self.status.lock().unwrap().deleted_chunks += 1;
        }

        // emit the orphan events outside of any chunk lock
        for (container_id, fingerprints) in orphans {
            self.log.append(LogEvent::OrphanChunks {
                container_id,
                fingerprints,
            })?;
        }
        Ok(deleted)
    }
}

struct GcLogConsumer {
    inner: Weak<GcInner>,
}

impl LogConsumer for GcLogConsumer {
    fn replay_direct(&self, _log_id: u64, event: &LogEvent) -> Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        match event {
            LogEvent::BlockMappingWritten { pair }
            | LogEvent::BlockMappingDeleted { pair }
            | LogEvent::BlockMappingWriteFailed { pair } => inner.mark_in_combat(pair),
            _ => {}
        }
        Ok(())
    }

    fn replay_background(&self, log_id: u64, event: &LogEvent) -> Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        match event {
            LogEvent::BlockMappingWritten { pair } | LogEvent::BlockMappingDeleted { pair } => {
                inner.apply_diff(log_id, pair)?;
            }
            LogEvent::BlockMappingWriteFailed { pair } => {
                // the failed write never changed any mapping; only record
                // the log id so stray replays of the transition stay void
                for (fingerprint, _) in pair.diff() {
                    let guard = inner.chunk_index.locks().lock(&fingerprint);
                    inner
                        .chunk_index
                        .note_failed_write(&fingerprint, log_id, &guard)?;
                }
            }
            LogEvent::LogEmpty => {
                inner.chunk_index.clear_in_combat();
            }
            _ => {}
        }
        Ok(())
    }

    fn replay_dirty_start(&self, _log_id: u64, event: &LogEvent) -> Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        // unreplayed mapping changes make their fingerprints combatants
        // until background replay catches up and LogEmpty clears the set
        match event {
            LogEvent::BlockMappingWritten { pair }
            | LogEvent::BlockMappingDeleted { pair }
            | LogEvent::BlockMappingWriteFailed { pair } => inner.mark_in_combat(pair),
            _ => {}
        }
        Ok(())
    }
}

struct GcIdleConsumer {
    inner: Weak<GcInner>,
}

impl IdleConsumer for GcIdleConsumer {
    fn on_idle_tick(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let batch = inner.config.batch_size;
            if let Err(err) = inner.process_candidates(batch) {
                log::error!("GC candidate processing failed - {err}");
            }
        }
    }

    fn on_idle_end(&self) {
        // candidate processing simply stops at the batch boundary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_mapping::{BlockMapping, BlockMappingItem, BlockMappingPair};
    use crate::chunk_store::ChunkStore;
    use crate::error::ErrorContext;
    use bds_api_types::{
        ChunkIndexConfig, ChunkStoreConfig, CompressionType, IndexConfig, LogConfig,
        SamplingStrategy, WriteCacheStrategy,
    };
    use std::path::PathBuf;

    struct Fixture {
        _dir: PathBuf,
        log: Arc<OperationLog>,
        store: Arc<ChunkStore>,
        chunk_index: Arc<ChunkIndex>,
        gc: GarbageCollector,
    }

    fn fixture(name: &str) -> Fixture {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-gc-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let log_config = LogConfig {
            filename: vec![dir.join("log-0.seg").to_string_lossy().into_owned()],
            max_log_size: 1 << 20,
            replay_check_interval_ms: 5,
        };
        let log = Arc::new(OperationLog::open(&log_config).unwrap());
        log.start(true).unwrap();

        let store_config = ChunkStoreConfig {
            path: dir.join("chunks").to_string_lossy().into_owned(),
            container_size: 64 * 1024,
            container_file_count: 1,
            containers_per_file: 64,
            write_cache_size: 2,
            write_cache_strategy: WriteCacheStrategy::EarliestFree,
            write_cache_timeout_secs: 0,
            committer_threads: 1,
            compression: CompressionType::None,
            read_cache_size: 8,
            full_threshold: 0.95,
            container_index: IndexConfig::mem(),
        };
        let store = Arc::new(ChunkStore::open(&store_config, log.clone()).unwrap());

        let index_config = ChunkIndexConfig {
            persistent: IndexConfig::mem(),
            chunk_lock_count: 64,
            sampling_strategy: SamplingStrategy::Full,
            sampling_factor: 4,
            in_combat_capacity: 1024,
            in_combat_error_rate: 0.01,
            bg_check_interval_ms: 10,
            bg_batch_size: 16,
        };
        let chunk_index = Arc::new(ChunkIndex::new(&index_config, store.clone()).unwrap());

        let gc_config = GcConfig {
            mode: GcMode::UsageCount,
            candidate_index: IndexConfig::mem(),
            batch_size: 16,
            throttle_soft_limit: 16,
            throttle_hard_limit: 32,
            throttle_enabled: true,
        };
        let gc = GarbageCollector::new(&gc_config, chunk_index.clone(), log.clone()).unwrap();
        log.register_consumer("gc", gc.log_consumer());
        log.run();

        Fixture {
            _dir: dir,
            log,
            store,
            chunk_index,
            gc,
        }
    }

    fn indexed_chunk(fx: &Fixture, data: &[u8]) -> (Fingerprint, u64) {
        let mut ec = ErrorContext::new();
        let fp = Fingerprint::of_data(data);
        let address = fx.store.write_new(&fp, data, true, &mut ec).unwrap();
        let mut mapping = ChunkMapping::new(fp);
        mapping.data_address = address;
        {
            let guard = fx.chunk_index.locks().lock(&fp);
            fx.chunk_index.put(&mapping, &guard).unwrap();
        }
        (fp, address)
    }

    fn written_pair(fx: &Fixture, block_id: u64, fp: Fingerprint, address: u64) -> BlockMappingPair {
        let old = BlockMapping::new(block_id, 4096);
        let mut new = BlockMapping::new(block_id, 4096);
        new.version = 1;
        new.items = vec![BlockMappingItem {
            fingerprint: fp,
            chunk_offset: 0,
            size: 4096,
            data_address: address,
        }];
        BlockMappingPair::from_mappings(&old, &new)
    }

    #[test]
    fn usage_counts_follow_the_log() {
        let fx = fixture("counts");
        let (fp, address) = indexed_chunk(&fx, &[1u8; 4096]);

        let pair = written_pair(&fx, 1, fp, address);
        fx.log.append(LogEvent::BlockMappingWritten { pair: pair.clone() }).unwrap();
        assert!(fx.log.wait_replayed(std::time::Duration::from_secs(5)));

        let mut mapping = ChunkMapping::new(fp);
        {
            let guard = fx.chunk_index.locks().lock(&fp);
            fx.chunk_index.lookup(&mut mapping, &guard).unwrap();
        }
        assert_eq!(mapping.usage_count, 1);

        // overwrite with zeros: the count drops to zero, the chunk becomes
        // a candidate
        let old = pair.modified_mapping(1);
        let mut new = BlockMapping::new(1, 4096);
        new.version = 2;
        let pair = BlockMappingPair::from_mappings(&old, &new);
        fx.log.append(LogEvent::BlockMappingWritten { pair }).unwrap();
        assert!(fx.log.wait_replayed(std::time::Duration::from_secs(5)));

        assert_eq!(fx.gc.candidate_count().unwrap(), 1);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn candidates_are_deleted_when_idle() {
        let fx = fixture("delete");
        let (fp, address) = indexed_chunk(&fx, &[2u8; 4096]);

        let pair = written_pair(&fx, 2, fp, address);
        fx.log.append(LogEvent::BlockMappingWritten { pair: pair.clone() }).unwrap();
        let old = pair.modified_mapping(1);
        let new = BlockMapping::new(2, 4096);
        let mut new = new;
        new.version = 2;
        let pair = BlockMappingPair::from_mappings(&old, &new);
        fx.log.append(LogEvent::BlockMappingWritten { pair }).unwrap();
        assert!(fx.log.wait_replayed(std::time::Duration::from_secs(5)));

        // wait for LogEmpty to clear the in-combat set
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while fx.chunk_index.is_in_combat(&fp) {
            assert!(std::time::Instant::now() < deadline, "in-combat never cleared");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert_eq!(fx.gc.process_candidates(16).unwrap(), 1);
        assert_eq!(fx.gc.candidate_count().unwrap(), 0);

        // the chunk index entry is gone
        let mut mapping = ChunkMapping::new(fp);
        let guard = fx.chunk_index.locks().lock(&fp);
        assert_eq!(
            fx.chunk_index.lookup(&mut mapping, &guard).unwrap(),
            LookupOutcome::NotFound
        );
        drop(guard);
        assert_eq!(fx.gc.status().deleted_chunks, 1);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn in_combat_blocks_deletion() {
        let fx = fixture("combat");
        let (fp, address) = indexed_chunk(&fx, &[3u8; 4096]);

        let pair = written_pair(&fx, 3, fp, address);
        fx.log.append(LogEvent::BlockMappingWritten { pair: pair.clone() }).unwrap();
        let old = pair.modified_mapping(1);
        let mut new = BlockMapping::new(3, 4096);
        new.version = 2;
        let pair = BlockMappingPair::from_mappings(&old, &new);
        fx.log.append(LogEvent::BlockMappingWritten { pair }).unwrap();
        assert!(fx.log.wait_replayed(std::time::Duration::from_secs(5)));

        // the fingerprint is (still) in combat: nothing may be deleted
        fx.chunk_index.mark_in_combat(&fp);
        assert_eq!(fx.gc.process_candidates(16).unwrap(), 0);
        assert_eq!(fx.gc.status().skipped_in_combat, 1);
        assert_eq!(fx.gc.candidate_count().unwrap(), 1);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn replay_is_idempotent() {
        let fx = fixture("idem");
        let (fp, address) = indexed_chunk(&fx, &[4u8; 4096]);

        let pair = written_pair(&fx, 4, fp, address);
        let consumer = fx.gc.log_consumer();
        consumer
            .replay_background(77, &LogEvent::BlockMappingWritten { pair: pair.clone() })
            .unwrap();
        let after_once = {
            let guard = fx.chunk_index.locks().lock(&fp);
            let mut mapping = ChunkMapping::new(fp);
            fx.chunk_index.lookup(&mut mapping, &guard).unwrap();
            mapping.usage_count
        };
        // replaying the same log id again must not change anything
        consumer
            .replay_background(77, &LogEvent::BlockMappingWritten { pair })
            .unwrap();

        let mut mapping = ChunkMapping::new(fp);
        let guard = fx.chunk_index.locks().lock(&fp);
        fx.chunk_index.lookup(&mut mapping, &guard).unwrap();
        drop(guard);
        assert_eq!(mapping.usage_count, after_once);
        assert_eq!(after_once, 2);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn paused_gc_does_not_reclaim() {
        let fx = fixture("paused");
        let (fp, address) = indexed_chunk(&fx, &[5u8; 4096]);
        let pair = written_pair(&fx, 5, fp, address);
        fx.log.append(LogEvent::BlockMappingWritten { pair: pair.clone() }).unwrap();
        let old = pair.modified_mapping(1);
        let mut new = BlockMapping::new(5, 4096);
        new.version = 2;
        let pair = BlockMappingPair::from_mappings(&old, &new);
        fx.log.append(LogEvent::BlockMappingWritten { pair }).unwrap();
        assert!(fx.log.wait_replayed(std::time::Duration::from_secs(5)));

        fx.gc.pause();
        assert_eq!(fx.gc.process_candidates(16).unwrap(), 0);
        fx.gc.resume();
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }
}
