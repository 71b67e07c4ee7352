//! Engine wiring and lifecycle.
//!
//! `DedupSystem` owns every subsystem, registers the log and idle
//! consumers and drives the Init/Start/Run/Stop lifecycle. The log
//! brokers all cross-component mutation, so construction order is free of
//! cycles: components hold references downward only and talk upward
//! through log events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bds_api_types::{GarbageCollectionStatus, SystemConfig, VolumeConfig, SECTOR_SIZE};
use bds_tools::parachute::{MemoryParachute, PressureListener};

use crate::block_index::BlockIndex;
use crate::chunk_index::ChunkIndex;
use crate::chunk_store::ChunkStore;
use crate::error::{DedupError, ErrorContext, Result};
use crate::filter::{
    BlockIndexFilter, BloomFilter, ByteCompareFilter, ChunkIndexFilter, Filter, FilterChain,
    SamplingFilter, ZeroChunkFilter,
};
use crate::gc::GarbageCollector;
use crate::idle_detector::{IdleConsumer, IdleDetector};
use crate::info_store::InfoStore;
use crate::log_store::OperationLog;
use crate::scsi::ScsiResult;
use crate::session::EngineRefs;
use crate::volume::{DedupVolume, Request};

// the sampling filter runs before any filter that can conclude
// `NotExisting`, so the anchor flag is set on every path
const DEFAULT_FILTERS: &[&str] = &["zero-chunk", "sampling", "bloom", "block-index", "chunk-index"];

pub struct DedupSystem {
    config: SystemConfig,
    refs: Arc<EngineRefs>,
    gc: Arc<GarbageCollector>,
    idle: Arc<IdleDetector>,
    info_store: InfoStore,
    bloom: Arc<BloomFilter>,
    parachute: MemoryParachute,
    volumes: RwLock<HashMap<u16, Arc<DedupVolume>>>,
    started: AtomicBool,
}

impl DedupSystem {
    pub fn new(config: SystemConfig) -> Result<Self> {
        if config.block_size % SECTOR_SIZE != 0 || config.block_size == 0 {
            return Err(DedupError::programming(
                "block size must be a positive multiple of the sector size",
            ));
        }

        let log = Arc::new(OperationLog::open(&config.log)?);
        let store = Arc::new(ChunkStore::open(&config.chunk_store, log.clone())?);
        let chunk_index = Arc::new(ChunkIndex::new(&config.chunk_index, store.clone())?);
        let block_index = Arc::new(BlockIndex::new(&config.block_index, store.clone())?);
        let gc = Arc::new(GarbageCollector::new(&config.gc, chunk_index.clone(), log.clone())?);
        let idle = Arc::new(IdleDetector::new(&config.idle));
        let info_store = InfoStore::new(
            crate::index_factory::open_index(&config.info_store).map_err(DedupError::Other)?,
        );
        let bloom = Arc::new(BloomFilter::new(config.chunk_index.persistent.capacity, 0.01));

        log.register_consumer("chunk-store", store.log_consumer());
        log.register_consumer("chunk-index", chunk_index.log_consumer());
        log.register_consumer("block-index", block_index.log_consumer());
        log.register_consumer("gc", gc.log_consumer());
        idle.register("gc", gc.idle_consumer());
        idle.register(
            "chunk-store-maintenance",
            Arc::new(StoreMaintenance {
                store: Arc::downgrade(&store),
            }),
        );

        // emergency reserve; listeners shed caches when it opens
        let parachute = MemoryParachute::new(8 * 1024 * 1024);
        parachute.register(Box::new(StoreCacheShedder {
            store: Arc::downgrade(&store),
        }));

        let refs = Arc::new(EngineRefs {
            block_size: config.block_size,
            store,
            chunk_index,
            block_index,
            log,
        });

        let system = Self {
            config,
            refs,
            gc,
            idle,
            info_store,
            bloom,
            parachute,
            volumes: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        };

        for volume_config in system.config.volumes.clone() {
            system.attach_volume(&volume_config)?;
        }
        Ok(system)
    }

    fn build_filter(&self, name: &str) -> Result<Arc<dyn Filter>> {
        let filter: Arc<dyn Filter> = match name {
            "zero-chunk" => Arc::new(ZeroChunkFilter),
            "bloom" => self.bloom.clone(),
            "sampling" => Arc::new(SamplingFilter::new(self.refs.chunk_index.clone())),
            "block-index" => Arc::new(BlockIndexFilter::new(1024)),
            "chunk-index" => Arc::new(ChunkIndexFilter::new(
                self.refs.chunk_index.clone(),
                self.config.chunk_index.sampling_strategy,
            )),
            "byte-compare" => Arc::new(ByteCompareFilter::new(self.refs.store.clone())),
            other => {
                return Err(DedupError::programming(format!("unknown filter '{other}'")));
            }
        };
        Ok(filter)
    }

    fn build_chain(&self, names: &[String]) -> Result<Arc<FilterChain>> {
        let names: Vec<String> = if names.is_empty() {
            DEFAULT_FILTERS.iter().map(|name| name.to_string()).collect()
        } else {
            names.to_vec()
        };
        let mut filters = Vec::with_capacity(names.len());
        for name in &names {
            filters.push(self.build_filter(name)?);
        }
        Ok(Arc::new(FilterChain::new(filters)))
    }

    /// Attach a volume; its configuration is remembered in the info store
    /// so it comes back after a restart.
    pub fn attach_volume(&self, config: &VolumeConfig) -> Result<Arc<DedupVolume>> {
        let mut volumes = self.volumes.write().unwrap();
        if volumes.contains_key(&config.id) {
            return Err(DedupError::programming(format!(
                "volume {} is already attached",
                config.id
            )));
        }
        let chain = self.build_chain(&config.filters)?;
        let volume = Arc::new(DedupVolume::new(
            config,
            self.refs.clone(),
            chain,
            Some(self.idle.clone()),
        )?);
        volumes.insert(config.id, volume.clone());
        drop(volumes);
        self.persist_volume_registry()?;
        Ok(volume)
    }

    pub fn detach_volume(&self, volume_id: u16) -> Result<()> {
        if self.volumes.write().unwrap().remove(&volume_id).is_none() {
            return Err(DedupError::programming(format!(
                "volume {volume_id} is not attached"
            )));
        }
        self.persist_volume_registry()
    }

    fn persist_volume_registry(&self) -> Result<()> {
        let volumes = self.volumes.read().unwrap();
        let mut registered: Vec<VolumeConfig> =
            volumes.values().map(|volume| volume.config().clone()).collect();
        registered.sort_by_key(|config| config.id);
        self.info_store
            .persist("volume.registry", &registered)
            .map_err(DedupError::Other)
    }

    pub fn volume(&self, volume_id: u16) -> Option<Arc<DedupVolume>> {
        self.volumes.read().unwrap().get(&volume_id).cloned()
    }

    /// Recover state and start all background machinery.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DedupError::programming("system is already started"));
        }

        self.refs.log.start(self.refs.log.is_first_start())?;

        // volumes registered in an earlier run come back automatically
        if let Some(registered) = self
            .info_store
            .restore::<Vec<VolumeConfig>>("volume.registry")
            .map_err(DedupError::Other)?
        {
            for config in registered {
                if self.volume(config.id).is_none() {
                    self.attach_volume(&config)?;
                }
            }
        }

        // recovered mappings that reference containers lost in the crash
        // lie beyond the recoverable prefix and are dropped
        let dropped = self.refs.block_index.drop_unrecoverable()?;
        if dropped > 0 {
            log::warn!("dropped {dropped} unrecoverable block mappings during recovery");
        }

        // the bloom pre-filter is best-effort state, rebuilt from the index
        let known = self.refs.chunk_index.known_fingerprints()?;
        self.bloom.rebuild(&known);

        if let Some(status) = self
            .info_store
            .restore::<GarbageCollectionStatus>("gc.status")
            .map_err(DedupError::Other)?
        {
            self.gc.restore_status(status);
        }

        self.refs.log.run();
        self.refs.chunk_index.run();
        self.refs.block_index.run();
        self.idle.run();
        log::info!("dedup system started");
        Ok(())
    }

    pub fn make_request(
        &self,
        volume_id: u16,
        request: Request,
        ec: &mut ErrorContext,
    ) -> ScsiResult {
        if !self.started.load(Ordering::Acquire) {
            return ScsiResult::NOT_READY;
        }
        if matches!(request, Request::Write { .. }) {
            // writers help the GC keep up once the candidate backlog runs
            // over the hard limit
            match self.gc.throttle_exceeded() {
                Ok(true) => {
                    let batch = self.config.gc.batch_size;
                    if let Err(err) = self.gc.process_candidates(batch) {
                        log::warn!("inline GC batch failed - {err}");
                    }
                }
                Ok(false) => {}
                Err(err) => log::warn!("GC throttle check failed - {err}"),
            }
        }
        match self.volume(volume_id) {
            Some(volume) => volume.make_request(request, ec),
            None => ScsiResult::ILLEGAL_REQUEST,
        }
    }

    pub fn fast_copy(
        &self,
        src_volume: u16,
        src_offset: u64,
        tgt_volume: u16,
        tgt_offset: u64,
        size: u64,
    ) -> Result<()> {
        let source = self
            .volume(src_volume)
            .ok_or_else(|| DedupError::programming(format!("unknown volume {src_volume}")))?;
        let target = self
            .volume(tgt_volume)
            .ok_or_else(|| DedupError::programming(format!("unknown volume {tgt_volume}")))?;
        source.fast_copy_to(src_offset, &target, tgt_offset, size)
    }

    /// Push all volatile state towards the persistent structures: close
    /// open containers, migrate chunk index entries, import ready block
    /// mappings.
    pub fn flush(&self) -> Result<()> {
        self.refs.store.flush()?;
        self.refs.chunk_index.migrate_committed(usize::MAX)?;
        self.refs.block_index.import_ready()?;
        Ok(())
    }

    /// Release the emergency memory reserve and ask listeners to shed
    /// caches. Called by the embedder on allocation pressure.
    pub fn on_memory_pressure(&self) -> bool {
        self.parachute.open()
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn idle_detector(&self) -> &Arc<IdleDetector> {
        &self.idle
    }

    pub fn refs(&self) -> &Arc<EngineRefs> {
        &self.refs
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.refs.log
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "chunk-store": self.refs.store.stats().snapshot(),
            "chunk-index": self.refs.chunk_index.stats().snapshot(),
            "block-index": self.refs.block_index.stats().snapshot(),
            "gc": serde_json::to_value(self.gc.status()).unwrap(),
            "log": {
                "next-log-id": self.refs.log.next_log_id(),
                "acked-log-id": self.refs.log.acked_log_id(),
                "outstanding": self.refs.log.outstanding_events(),
            },
        })
    }

    /// Stop every subsystem. Fast stop abandons non-essential background
    /// work (GC candidates, compaction) but still drains in-flight
    /// container commits and the block index ready queue.
    pub fn stop(&self, fast: bool) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.idle.stop()?;
        self.gc.pause();

        if !fast {
            // one final reclaim round while everything is still up
            let batch = usize::MAX;
            if let Err(err) = self.gc.process_candidates(batch) {
                log::warn!("final GC round failed - {err}");
            }
        }

        self.refs.store.flush()?;
        self.refs.block_index.stop()?;
        self.refs.chunk_index.stop()?;
        self.refs.store.stop()?;

        self.info_store
            .persist("gc.status", &self.gc.status())
            .map_err(DedupError::Other)?;
        self.info_store
            .persist("statistics", &self.statistics())
            .map_err(DedupError::Other)?;
        self.info_store.sync().map_err(DedupError::Other)?;

        self.refs.log.stop()?;
        log::info!("dedup system stopped");
        Ok(())
    }
}

struct StoreCacheShedder {
    store: Weak<ChunkStore>,
}

impl PressureListener for StoreCacheShedder {
    fn on_memory_pressure(&self) {
        if let Some(store) = self.store.upgrade() {
            store.shed_caches();
        }
    }
}

/// Idle-time chunk store housekeeping: close idle open containers and run
/// one compaction step per tick.
struct StoreMaintenance {
    store: Weak<ChunkStore>,
}

impl IdleConsumer for StoreMaintenance {
    fn on_idle_tick(&self) {
        if let Some(store) = self.store.upgrade() {
            if let Err(err) = store.close_idle_containers() {
                log::warn!("closing idle containers failed - {err}");
            }
            match store.merge_step() {
                Ok(true) => log::debug!("idle merge step reclaimed a container"),
                Ok(false) => {}
                Err(err) => log::warn!("idle merge step failed - {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bds_api_types::{
        BlockIndexConfig, ChunkIndexConfig, ChunkStoreConfig, ChunkerType, CompressionType,
        GcConfig, GcMode, IdleDetectorConfig, IndexConfig, LogConfig, SamplingStrategy,
        WriteCacheStrategy,
    };
    use std::path::PathBuf;

    pub(crate) fn test_config(dir: &PathBuf) -> SystemConfig {
        SystemConfig {
            block_size: 4096,
            chunk_store: ChunkStoreConfig {
                path: dir.join("chunks").to_string_lossy().into_owned(),
                container_size: 64 * 1024,
                container_file_count: 2,
                containers_per_file: 64,
                write_cache_size: 2,
                write_cache_strategy: WriteCacheStrategy::EarliestFree,
                write_cache_timeout_secs: 1,
                committer_threads: 2,
                compression: CompressionType::Zstd,
                read_cache_size: 8,
                full_threshold: 0.95,
                container_index: IndexConfig::mem(),
            },
            chunk_index: ChunkIndexConfig {
                persistent: IndexConfig::mem(),
                chunk_lock_count: 64,
                sampling_strategy: SamplingStrategy::Full,
                sampling_factor: 4,
                in_combat_capacity: 1024,
                in_combat_error_rate: 0.01,
                bg_check_interval_ms: 10,
                bg_batch_size: 16,
            },
            block_index: BlockIndexConfig {
                persistent: IndexConfig::mem(),
                block_lock_count: 64,
                cache_size: 64,
                bg_check_interval_ms: 10,
            },
            log: LogConfig {
                filename: vec![
                    dir.join("log-0.seg").to_string_lossy().into_owned(),
                    dir.join("log-1.seg").to_string_lossy().into_owned(),
                ],
                max_log_size: 1 << 20,
                replay_check_interval_ms: 5,
            },
            gc: GcConfig {
                mode: GcMode::UsageCount,
                candidate_index: IndexConfig::mem(),
                batch_size: 32,
                throttle_soft_limit: 1024,
                throttle_hard_limit: 4096,
                throttle_enabled: true,
            },
            idle: IdleDetectorConfig {
                idle_throughput: 1.0,
                idle_duration_secs: 3600,
            },
            info_store: IndexConfig::mem(),
            volumes: vec![VolumeConfig {
                id: 0,
                logical_size: 1024 * 1024,
                chunker: ChunkerType::RollingHash,
                avg_chunk_size: 4096,
                session_count: 2,
                filters: Vec::new(),
            }],
        }
    }

    fn testdir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-system-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_read_round_trip() {
        let dir = testdir("roundtrip");
        let system = DedupSystem::new(test_config(&dir)).unwrap();
        system.start().unwrap();

        let data: Vec<u8> = (0..16 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut ec = ErrorContext::new();
        let result = system.make_request(
            0,
            Request::Write {
                offset: 0,
                data: &data,
            },
            &mut ec,
        );
        assert!(result.is_ok(), "write failed: {result}");

        let mut buf = vec![0u8; data.len()];
        let result = system.make_request(
            0,
            Request::Read {
                offset: 0,
                buf: &mut buf,
            },
            &mut ec,
        );
        assert!(result.is_ok(), "read failed: {result}");
        assert_eq!(buf, data);

        system.stop(false).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn misaligned_request_is_illegal() {
        let dir = testdir("align");
        let system = DedupSystem::new(test_config(&dir)).unwrap();
        system.start().unwrap();

        let mut ec = ErrorContext::new();
        let result = system.make_request(
            0,
            Request::Write {
                offset: 100,
                data: &[0u8; 512],
            },
            &mut ec,
        );
        assert_eq!(result, ScsiResult::ILLEGAL_REQUEST);

        let result = system.make_request(
            7,
            Request::Write {
                offset: 0,
                data: &[0u8; 512],
            },
            &mut ec,
        );
        assert_eq!(result, ScsiResult::ILLEGAL_REQUEST);

        system.stop(true).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn requests_before_start_are_not_ready() {
        let dir = testdir("notready");
        let system = DedupSystem::new(test_config(&dir)).unwrap();
        let mut ec = ErrorContext::new();
        let result = system.make_request(
            0,
            Request::Write {
                offset: 0,
                data: &[1u8; 512],
            },
            &mut ec,
        );
        assert_eq!(result, ScsiResult::NOT_READY);
        // NotReady is a recoverable condition for the initiator
        assert!(result.is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn attach_and_detach_volumes() {
        let dir = testdir("volumes");
        let system = DedupSystem::new(test_config(&dir)).unwrap();
        let config = VolumeConfig {
            id: 5,
            logical_size: 64 * 4096,
            chunker: ChunkerType::Static,
            avg_chunk_size: 4096,
            session_count: 1,
            filters: vec!["zero-chunk".into(), "chunk-index".into()],
        };
        let volume = system.attach_volume(&config).unwrap();
        assert_eq!(volume.id(), 5);
        assert!(system.attach_volume(&config).is_err());
        system.detach_volume(5).unwrap();
        assert!(system.volume(5).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
