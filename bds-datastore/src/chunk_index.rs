//! Fingerprint to chunk metadata index.
//!
//! Entries whose container is not yet committed live in an in-memory
//! auxiliary map that lookups consult first; a background committer
//! migrates them to the persistent back-end once their container is
//! durable. Usage count changes are gated by the per-fingerprint chunk
//! lock and a monotone log id, which makes log replay idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bds_api_types::{ChunkIndexConfig, SamplingStrategy};
use bds_index::Index;
use bds_tools::bloom_set::BloomSet;

use crate::chunk_locks::{ChunkLockGuard, ChunkLocks};
use crate::chunk_store::{ChunkStore, CommitState};
use crate::error::{DedupError, Result};
use crate::fingerprint::Fingerprint;
use crate::{EMPTY_DATA_ADDRESS, ILLEGAL_DATA_ADDRESS};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMapping {
    pub fingerprint: Fingerprint,
    pub data_address: u64,
    pub usage_count: u64,
    pub usage_count_change_log_id: u64,
    pub usage_count_failed_write_change_log_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hint: Option<u64>,
    pub indexed: bool,
    /// Runtime flag: the filter chain proved this chunk already exists.
    #[serde(skip)]
    pub known_chunk: bool,
}

impl ChunkMapping {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            data_address: ILLEGAL_DATA_ADDRESS,
            usage_count: 0,
            usage_count_change_log_id: 0,
            usage_count_failed_write_change_log_id: 0,
            block_hint: None,
            indexed: true,
            known_chunk: false,
        }
    }

    pub fn has_data_address(&self) -> bool {
        self.data_address != ILLEGAL_DATA_ADDRESS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Found,
    NotFound,
}

#[derive(Default)]
pub struct ChunkIndexStat {
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
    pub puts: AtomicU64,
    pub usage_count_changes: AtomicU64,
    pub stale_usage_count_changes: AtomicU64,
    pub migrated: AtomicU64,
}

impl ChunkIndexStat {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "lookups": self.lookups.load(Ordering::Relaxed),
            "hits": self.hits.load(Ordering::Relaxed),
            "puts": self.puts.load(Ordering::Relaxed),
            "usage-count-changes": self.usage_count_changes.load(Ordering::Relaxed),
            "stale-usage-count-changes": self.stale_usage_count_changes.load(Ordering::Relaxed),
            "migrated": self.migrated.load(Ordering::Relaxed),
        })
    }
}

struct ChunkIndexInner {
    persistent: Arc<dyn Index>,
    auxiliary: Mutex<HashMap<Fingerprint, ChunkMapping>>,
    locks: ChunkLocks,
    in_combat: Mutex<BloomSet>,
    config: ChunkIndexConfig,
    store: Arc<ChunkStore>,
    stats: ChunkIndexStat,
    stop: AtomicBool,
}

pub struct ChunkIndex {
    inner: Arc<ChunkIndexInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ChunkIndex {
    pub fn new(config: &ChunkIndexConfig, store: Arc<ChunkStore>) -> Result<Self> {
        let persistent =
            crate::index_factory::open_index(&config.persistent).map_err(DedupError::Other)?;
        let inner = Arc::new(ChunkIndexInner {
            persistent,
            auxiliary: Mutex::new(HashMap::new()),
            locks: ChunkLocks::new(config.chunk_lock_count),
            in_combat: Mutex::new(BloomSet::with_error_rate(
                config.in_combat_capacity,
                config.in_combat_error_rate,
            )),
            config: config.clone(),
            store,
            stats: ChunkIndexStat::default(),
            stop: AtomicBool::new(false),
        });
        Ok(Self {
            inner,
            worker: Mutex::new(None),
        })
    }

    pub fn locks(&self) -> &ChunkLocks {
        &self.inner.locks
    }

    pub fn stats(&self) -> &ChunkIndexStat {
        &self.inner.stats
    }

    /// Whether the fingerprint is indexed under the configured sampling
    /// strategy.
    pub fn is_anchor(&self, fingerprint: &Fingerprint) -> bool {
        match self.inner.config.sampling_strategy {
            SamplingStrategy::Full => true,
            SamplingStrategy::Sampling => {
                fingerprint.matches_sampling_mask(self.inner.config.sampling_factor)
            }
        }
    }

    fn check_guard(guard: &ChunkLockGuard, fingerprint: &Fingerprint) -> Result<()> {
        if !guard.covers(fingerprint) {
            return Err(DedupError::programming(
                "chunk lock guard does not cover the fingerprint",
            ));
        }
        Ok(())
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<(ChunkMapping, bool)>> {
        if let Some(mapping) = self.inner.auxiliary.lock().unwrap().get(fingerprint) {
            return Ok(Some((mapping.clone(), true)));
        }
        match self.inner.persistent.lookup(fingerprint.as_bytes())? {
            None => Ok(None),
            Some(payload) => {
                let mapping: ChunkMapping = serde_json::from_slice(&payload).map_err(|err| {
                    DedupError::integrity(format!(
                        "chunk index entry for {fingerprint} undecodable: {err}"
                    ))
                })?;
                Ok(Some((mapping, false)))
            }
        }
    }

    fn store_mapping(&self, mapping: &ChunkMapping, auxiliary: bool) -> Result<()> {
        if auxiliary {
            self.inner
                .auxiliary
                .lock()
                .unwrap()
                .insert(mapping.fingerprint, mapping.clone());
        } else {
            let payload = serde_json::to_vec(mapping)
                .map_err(|err| DedupError::programming(format!("mapping encode: {err}")))?;
            self.inner.persistent.put(mapping.fingerprint.as_bytes(), &payload)?;
        }
        Ok(())
    }

    /// Fill `mapping` from the index. The auxiliary map wins over the
    /// persistent back-end.
    pub fn lookup(
        &self,
        mapping: &mut ChunkMapping,
        guard: &ChunkLockGuard,
    ) -> Result<LookupOutcome> {
        Self::check_guard(guard, &mapping.fingerprint)?;
        if mapping.fingerprint.is_empty_chunk() {
            return Err(DedupError::programming(
                "the empty chunk is never indexed",
            ));
        }
        self.inner.stats.lookups.fetch_add(1, Ordering::Relaxed);

        match self.load(&mapping.fingerprint)? {
            None => Ok(LookupOutcome::NotFound),
            Some((stored, _)) => {
                mapping.data_address = stored.data_address;
                mapping.usage_count = stored.usage_count;
                mapping.usage_count_change_log_id = stored.usage_count_change_log_id;
                mapping.usage_count_failed_write_change_log_id =
                    stored.usage_count_failed_write_change_log_id;
                mapping.block_hint = stored.block_hint;
                mapping.indexed = stored.indexed;
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(LookupOutcome::Found)
            }
        }
    }

    /// Insert or update a mapping. Entries of uncommitted containers go to
    /// the auxiliary map; non-anchors are not indexed at all.
    pub fn put(&self, mapping: &ChunkMapping, guard: &ChunkLockGuard) -> Result<()> {
        Self::check_guard(guard, &mapping.fingerprint)?;
        if mapping.fingerprint.is_empty_chunk() {
            return Err(DedupError::programming("the empty chunk is never indexed"));
        }
        if !mapping.indexed {
            return Ok(());
        }
        if mapping.data_address == EMPTY_DATA_ADDRESS {
            return Err(DedupError::programming("mapping with the empty address"));
        }
        self.inner.stats.puts.fetch_add(1, Ordering::Relaxed);

        let committed = mapping.has_data_address()
            && self.inner.store.is_committed(mapping.data_address)? == CommitState::Committed;
        self.store_mapping(mapping, !committed)
    }

    /// Apply a usage count delta, gated by the stored change log id: the
    /// delta is applied iff `log_id` is strictly greater. Returns the new
    /// usage count, or None when the fingerprint is not indexed.
    pub fn change_usage_count(
        &self,
        fingerprint: &Fingerprint,
        delta: i32,
        log_id: u64,
        guard: &ChunkLockGuard,
    ) -> Result<Option<u64>> {
        Self::check_guard(guard, fingerprint)?;
        if fingerprint.is_empty_chunk() {
            return Ok(None);
        }

        let (mut mapping, auxiliary) = match self.load(fingerprint)? {
            Some(loaded) => loaded,
            None => return Ok(None),
        };
        if log_id <= mapping.usage_count_change_log_id {
            self.inner
                .stats
                .stale_usage_count_changes
                .fetch_add(1, Ordering::Relaxed);
            return Ok(Some(mapping.usage_count));
        }

        if delta.is_negative() {
            mapping.usage_count = mapping.usage_count.saturating_sub(delta.unsigned_abs() as u64);
        } else {
            mapping.usage_count += delta as u64;
        }
        mapping.usage_count_change_log_id = log_id;
        self.store_mapping(&mapping, auxiliary)?;
        self.inner.stats.usage_count_changes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(mapping.usage_count))
    }

    /// Remember the log id of a failed block write touching this chunk;
    /// replays of the failed transition must not change the usage count.
    pub fn note_failed_write(
        &self,
        fingerprint: &Fingerprint,
        log_id: u64,
        guard: &ChunkLockGuard,
    ) -> Result<()> {
        Self::check_guard(guard, fingerprint)?;
        if let Some((mut mapping, auxiliary)) = self.load(fingerprint)? {
            if log_id > mapping.usage_count_failed_write_change_log_id {
                mapping.usage_count_failed_write_change_log_id = log_id;
                self.store_mapping(&mapping, auxiliary)?;
            }
        }
        Ok(())
    }

    pub fn delete(&self, fingerprint: &Fingerprint, guard: &ChunkLockGuard) -> Result<()> {
        Self::check_guard(guard, fingerprint)?;
        self.inner.auxiliary.lock().unwrap().remove(fingerprint);
        self.inner.persistent.delete(fingerprint.as_bytes())?;
        Ok(())
    }

    // --- in-combat tracking ------------------------------------------------

    /// Note that the fingerprint's usage count may still change because of
    /// unreplayed log events.
    pub fn mark_in_combat(&self, fingerprint: &Fingerprint) {
        self.inner
            .in_combat
            .lock()
            .unwrap()
            .insert(fingerprint.as_bytes());
    }

    pub fn is_in_combat(&self, fingerprint: &Fingerprint) -> bool {
        self.inner
            .in_combat
            .lock()
            .unwrap()
            .contains(fingerprint.as_bytes())
    }

    /// Called when the log reports all events replayed.
    pub fn clear_in_combat(&self) {
        self.inner.in_combat.lock().unwrap().clear();
    }

    // --- auxiliary migration ----------------------------------------------

    fn migratable(&self, limit: usize) -> Result<Vec<Fingerprint>> {
        let mut lost = Vec::new();
        let mut out = Vec::new();
        {
            let auxiliary = self.inner.auxiliary.lock().unwrap();
            for (fingerprint, mapping) in auxiliary.iter() {
                if out.len() >= limit {
                    break;
                }
                if !mapping.has_data_address() {
                    continue;
                }
                match self.inner.store.is_committed(mapping.data_address)? {
                    CommitState::Committed => out.push(*fingerprint),
                    CommitState::NotCommitted => {}
                    CommitState::WillNeverCommit => lost.push(*fingerprint),
                }
            }
        }
        if !lost.is_empty() {
            // the container never made it to disk; the entries are void
            let mut auxiliary = self.inner.auxiliary.lock().unwrap();
            for fingerprint in &lost {
                log::warn!("dropping chunk index entry for lost chunk {fingerprint}");
                auxiliary.remove(fingerprint);
            }
        }
        Ok(out)
    }

    /// Move auxiliary entries whose container committed to the persistent
    /// back-end. Returns the number of migrated entries.
    pub fn migrate_committed(&self, limit: usize) -> Result<usize> {
        let fingerprints = self.migratable(limit)?;
        let mut migrated = 0;
        for fingerprint in fingerprints {
            let guard = self.inner.locks.lock(&fingerprint);
            let mapping = match self.inner.auxiliary.lock().unwrap().get(&fingerprint) {
                Some(mapping) => mapping.clone(),
                None => continue,
            };
            // the container state may have regressed only if the store
            // failed, in which case the entry stays auxiliary
            if self.inner.store.is_committed(mapping.data_address)? != CommitState::Committed {
                continue;
            }
            self.store_mapping(&mapping, false)?;
            self.inner.auxiliary.lock().unwrap().remove(&fingerprint);
            drop(guard);
            migrated += 1;
        }
        if migrated > 0 {
            self.inner.stats.migrated.fetch_add(migrated as u64, Ordering::Relaxed);
        }
        Ok(migrated)
    }

    pub fn dirty_item_count(&self) -> usize {
        self.inner.auxiliary.lock().unwrap().len()
    }

    pub fn total_item_count(&self) -> Result<u64> {
        Ok(self.inner.persistent.item_count()? + self.dirty_item_count() as u64)
    }

    /// All indexed fingerprints, for bloom filter rebuilds at startup.
    pub fn known_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut out: Vec<Fingerprint> = self
            .inner
            .auxiliary
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        let mut iter = self.inner.persistent.iterate()?;
        while let Some((key, _payload)) = iter.next_entry()? {
            out.push(Fingerprint::from_slice(&key).map_err(DedupError::Other)?);
        }
        Ok(out)
    }

    /// Start the background committer.
    pub fn run(&self) {
        let inner = self.inner.clone();
        let batch = inner.config.bg_batch_size;
        let interval = Duration::from_millis(inner.config.bg_check_interval_ms);
        let index = ChunkIndexHandle {
            inner: inner.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("chunk-index-bg".into())
            .spawn(move || {
                while !inner.stop.load(Ordering::Acquire) {
                    match index.as_index().migrate_committed(batch) {
                        Ok(0) => std::thread::sleep(interval),
                        Ok(count) => log::debug!("chunk index migrated {count} entries"),
                        Err(err) => {
                            log::error!("chunk index migration failed - {err}");
                            std::thread::sleep(interval);
                        }
                    }
                }
            })
            .unwrap();
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| DedupError::programming("chunk index worker panicked"))?;
        }
        // stop-mode import: everything committed by now moves over
        loop {
            if self.migrate_committed(usize::MAX)? == 0 {
                break;
            }
        }
        self.inner.persistent.sync()?;
        Ok(())
    }
}

impl ChunkIndex {
    /// The log consumer rebuilding lost auxiliary entries during
    /// dirty-start replay. Register it before `OperationLog::start`.
    pub fn log_consumer(&self) -> Arc<dyn crate::log_store::LogConsumer> {
        Arc::new(ChunkIndexLogConsumer {
            inner: Arc::downgrade(&self.inner),
        })
    }
}

struct ChunkIndexLogConsumer {
    inner: std::sync::Weak<ChunkIndexInner>,
}

impl crate::log_store::LogConsumer for ChunkIndexLogConsumer {
    fn replay_dirty_start(
        &self,
        _log_id: u64,
        event: &crate::log_store::LogEvent,
    ) -> Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let index = ChunkIndex {
            inner,
            worker: Mutex::new(None),
        };
        if let crate::log_store::LogEvent::BlockMappingWritten { pair } = event {
            // a positive modifier means the chunk entered a block with this
            // write; restore its index entry if the crash took it
            for item in pair
                .items
                .iter()
                .filter(|item| item.usage_count_modifier > 0)
            {
                if item.fingerprint.is_empty_chunk()
                    || item.data_address == EMPTY_DATA_ADDRESS
                    || item.data_address == ILLEGAL_DATA_ADDRESS
                {
                    continue;
                }
                let guard = index.inner.locks.lock(&item.fingerprint);
                let mut probe = ChunkMapping::new(item.fingerprint);
                if index.lookup(&mut probe, &guard)? == LookupOutcome::NotFound {
                    probe.data_address = item.data_address;
                    probe.indexed = index.is_anchor(&item.fingerprint);
                    if probe.indexed {
                        index.put(&probe, &guard)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Worker-side view; avoids moving `ChunkIndex` itself into the thread.
struct ChunkIndexHandle {
    inner: Arc<ChunkIndexInner>,
}

impl ChunkIndexHandle {
    fn as_index(&self) -> ChunkIndex {
        ChunkIndex {
            inner: self.inner.clone(),
            worker: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;
    use bds_api_types::{
        ChunkStoreConfig, CompressionType, IndexConfig, LogConfig, WriteCacheStrategy,
    };
    use crate::log_store::OperationLog;
    use std::path::PathBuf;

    struct Fixture {
        _dir: PathBuf,
        log: Arc<OperationLog>,
        store: Arc<ChunkStore>,
        index: ChunkIndex,
    }

    fn fixture(name: &str, sampling: SamplingStrategy) -> Fixture {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-cidx-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let log_config = LogConfig {
            filename: vec![dir.join("log-0.seg").to_string_lossy().into_owned()],
            max_log_size: 1 << 20,
            replay_check_interval_ms: 5,
        };
        let log = Arc::new(OperationLog::open(&log_config).unwrap());
        log.start(true).unwrap();
        log.run();

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
            sampling_strategy: sampling,
            sampling_factor: 4,
            in_combat_capacity: 1024,
            in_combat_error_rate: 0.01,
            bg_check_interval_ms: 10,
            bg_batch_size: 16,
        };
        let index = ChunkIndex::new(&index_config, store.clone()).unwrap();
        Fixture {
            _dir: dir,
            log,
            store,
            index,
        }
    }

    fn stored_mapping(fx: &Fixture, data: &[u8]) -> ChunkMapping {
        let mut ec = ErrorContext::new();
        let fp = Fingerprint::of_data(data);
        let address = fx.store.write_new(&fp, data, true, &mut ec).unwrap();
        let mut mapping = ChunkMapping::new(fp);
        mapping.data_address = address;
        mapping.usage_count = 1;
        mapping.usage_count_change_log_id = 1;
        mapping
    }

    #[test]
    fn uncommitted_entries_stay_auxiliary() {
        let fx = fixture("aux", SamplingStrategy::Full);
        let mapping = stored_mapping(&fx, b"auxiliary data");

        {
            let guard = fx.index.locks().lock(&mapping.fingerprint);
            fx.index.put(&mapping, &guard).unwrap();
        }
        assert_eq!(fx.index.dirty_item_count(), 1);

        // lookup is served from the auxiliary map
        let mut probe = ChunkMapping::new(mapping.fingerprint);
        {
            let guard = fx.index.locks().lock(&probe.fingerprint);
            assert_eq!(fx.index.lookup(&mut probe, &guard).unwrap(), LookupOutcome::Found);
        }
        assert_eq!(probe.data_address, mapping.data_address);

        // once the container commits, migration drains the auxiliary
        fx.store.flush().unwrap();
        assert_eq!(fx.index.migrate_committed(16).unwrap(), 1);
        assert_eq!(fx.index.dirty_item_count(), 0);
        {
            let guard = fx.index.locks().lock(&probe.fingerprint);
            assert_eq!(fx.index.lookup(&mut probe, &guard).unwrap(), LookupOutcome::Found);
        }
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn usage_count_changes_are_idempotent() {
        let fx = fixture("idem", SamplingStrategy::Full);
        let mapping = stored_mapping(&fx, b"counted data");
        {
            let guard = fx.index.locks().lock(&mapping.fingerprint);
            fx.index.put(&mapping, &guard).unwrap();
        }

        let fp = mapping.fingerprint;
        let guard = fx.index.locks().lock(&fp);
        assert_eq!(fx.index.change_usage_count(&fp, 1, 5, &guard).unwrap(), Some(2));
        // replay of the same log id is ignored
        assert_eq!(fx.index.change_usage_count(&fp, 1, 5, &guard).unwrap(), Some(2));
        // an older log id is ignored, too
        assert_eq!(fx.index.change_usage_count(&fp, 1, 3, &guard).unwrap(), Some(2));
        // a newer one applies
        assert_eq!(fx.index.change_usage_count(&fp, -1, 6, &guard).unwrap(), Some(1));
        drop(guard);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn sampling_skips_non_anchors() {
        let fx = fixture("sampling", SamplingStrategy::Sampling);
        // find one anchor and one non-anchor fingerprint
        let mut anchor = None;
        let mut other = None;
        for i in 0u64..10_000 {
            let data = i.to_le_bytes().to_vec();
            let fp = Fingerprint::of_data(&data);
            if fx.index.is_anchor(&fp) {
                anchor.get_or_insert(data);
            } else {
                other.get_or_insert(data);
            }
            if anchor.is_some() && other.is_some() {
                break;
            }
        }
        let (anchor, other) = (anchor.unwrap(), other.unwrap());

        let mut mapping = stored_mapping(&fx, &anchor);
        mapping.indexed = fx.index.is_anchor(&mapping.fingerprint);
        {
            let guard = fx.index.locks().lock(&mapping.fingerprint);
            fx.index.put(&mapping, &guard).unwrap();
        }

        let mut mapping = stored_mapping(&fx, &other);
        mapping.indexed = fx.index.is_anchor(&mapping.fingerprint);
        {
            let guard = fx.index.locks().lock(&mapping.fingerprint);
            fx.index.put(&mapping, &guard).unwrap();
        }

        // only the anchor got indexed
        assert_eq!(fx.index.total_item_count().unwrap(), 1);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn in_combat_round_trip() {
        let fx = fixture("combat", SamplingStrategy::Full);
        let fp = Fingerprint::of_data(b"combatant");
        assert!(!fx.index.is_in_combat(&fp));
        fx.index.mark_in_combat(&fp);
        assert!(fx.index.is_in_combat(&fp));
        fx.index.clear_in_combat();
        assert!(!fx.index.is_in_combat(&fp));
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }
}
