//! Shared configuration and status types.
//!
//! These types are plain serde values so every subsystem (and the tests) can
//! construct and persist them without pulling in the engine crates.

use serde::{Deserialize, Serialize};

pub const SECTOR_SIZE: usize = 512;

/// Maximum size of a single chunk produced by any chunker.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Default container size (body + header + trailing CRC).
pub const DEFAULT_CONTAINER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
/// Compression applied to container items before commit.
pub enum CompressionType {
    #[default]
    None,
    Zstd,
    Deflate,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Selection policy for open containers in the write cache.
pub enum WriteCacheStrategy {
    /// Spread new items over the open containers cyclically.
    RoundRobin,
    /// Prefer the lowest uncontended slot, fall back to round-robin.
    #[default]
    EarliestFree,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
/// Which chunks get entries in the chunk index.
pub enum SamplingStrategy {
    /// Every chunk is indexed.
    #[default]
    Full,
    /// Only chunks whose fingerprint suffix matches the sampling mask.
    Sampling,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GcMode {
    /// No reclamation, block hints are still propagated.
    None,
    #[default]
    UsageCount,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Persistent index back-end selection.
pub enum IndexType {
    /// Volatile in-memory hash, for auxiliary maps and tests.
    Mem,
    /// Fixed record array addressed by small integer ids.
    Fixed,
    /// Bucketed on-disk hash.
    #[default]
    DiskHash,
    /// Embedded log-structured merge tree.
    Lsm,
    /// Embedded B+ tree.
    Btree,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct IndexConfig {
    #[serde(rename = "type")]
    pub index_type: IndexType,
    /// Base path(s) of the back-end files. Unused by `mem`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filename: Vec<String>,
    /// Expected item capacity, used for bucket auto-tuning.
    #[serde(default = "default_index_capacity")]
    pub capacity: u64,
    /// Record size for the `fixed` back-end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_size: Option<usize>,
}

const fn default_index_capacity() -> u64 {
    1024 * 1024
}

impl IndexConfig {
    pub fn mem() -> Self {
        Self {
            index_type: IndexType::Mem,
            filename: Vec::new(),
            capacity: default_index_capacity(),
            record_size: None,
        }
    }

    pub fn new<P: Into<String>>(index_type: IndexType, path: P) -> Self {
        Self {
            index_type,
            filename: vec![path.into()],
            capacity: default_index_capacity(),
            record_size: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkStoreConfig {
    /// Directory holding the container data files.
    pub path: String,
    #[serde(default = "default_container_size")]
    pub container_size: usize,
    /// Number of container data files.
    #[serde(default = "default_container_file_count")]
    pub container_file_count: usize,
    /// Maximum number of containers per data file; bounds the capacity.
    #[serde(default = "default_containers_per_file")]
    pub containers_per_file: u64,
    #[serde(default = "default_write_cache_size")]
    pub write_cache_size: usize,
    #[serde(default)]
    pub write_cache_strategy: WriteCacheStrategy,
    /// Seconds an open container may sit untouched before it is closed.
    #[serde(default = "default_write_cache_timeout")]
    pub write_cache_timeout_secs: u64,
    #[serde(default = "default_committer_threads")]
    pub committer_threads: usize,
    #[serde(default)]
    pub compression: CompressionType,
    /// Read cache capacity in containers.
    #[serde(default = "default_read_cache_size")]
    pub read_cache_size: usize,
    /// Fill ratio above which writes fail with a capacity error.
    #[serde(default = "default_full_threshold")]
    pub full_threshold: f64,
    /// Container index back-end (container id -> address).
    pub container_index: IndexConfig,
}

const fn default_container_size() -> usize {
    DEFAULT_CONTAINER_SIZE
}

const fn default_container_file_count() -> usize {
    4
}

const fn default_containers_per_file() -> u64 {
    4096
}

const fn default_write_cache_size() -> usize {
    8
}

const fn default_write_cache_timeout() -> u64 {
    4
}

const fn default_committer_threads() -> usize {
    8
}

const fn default_read_cache_size() -> usize {
    32
}

const fn default_full_threshold() -> f64 {
    0.95
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkIndexConfig {
    pub persistent: IndexConfig,
    #[serde(default = "default_chunk_lock_count")]
    pub chunk_lock_count: usize,
    #[serde(default)]
    pub sampling_strategy: SamplingStrategy,
    /// Power of two; a chunk is an anchor when `fp % factor == 0`.
    #[serde(default = "default_sampling_factor")]
    pub sampling_factor: u64,
    #[serde(default = "default_in_combat_capacity")]
    pub in_combat_capacity: u64,
    #[serde(default = "default_in_combat_error_rate")]
    pub in_combat_error_rate: f64,
    /// Background import check interval in milliseconds.
    #[serde(default = "default_bg_check_interval")]
    pub bg_check_interval_ms: u64,
    #[serde(default = "default_bg_batch_size")]
    pub bg_batch_size: usize,
}

const fn default_chunk_lock_count() -> usize {
    1021
}

const fn default_sampling_factor() -> u64 {
    4
}

const fn default_in_combat_capacity() -> u64 {
    256 * 1024
}

const fn default_in_combat_error_rate() -> f64 {
    0.01
}

const fn default_bg_check_interval() -> u64 {
    250
}

const fn default_bg_batch_size() -> usize {
    64
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct BlockIndexConfig {
    pub persistent: IndexConfig,
    #[serde(default = "default_block_lock_count")]
    pub block_lock_count: usize,
    /// Write-back cache capacity in block mappings.
    #[serde(default = "default_block_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_bg_check_interval")]
    pub bg_check_interval_ms: u64,
}

const fn default_block_lock_count() -> usize {
    1021
}

const fn default_block_cache_size() -> usize {
    4096
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    /// Log ring files, in order. File 0 carries the header sector.
    pub filename: Vec<String>,
    /// Maximum byte size per ring file.
    #[serde(default = "default_max_log_file_size")]
    pub max_log_size: u64,
    #[serde(default = "default_replay_check_interval")]
    pub replay_check_interval_ms: u64,
}

const fn default_max_log_file_size() -> u64 {
    64 * 1024 * 1024
}

const fn default_replay_check_interval() -> u64 {
    100
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct GcConfig {
    #[serde(default)]
    pub mode: GcMode,
    pub candidate_index: IndexConfig,
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: usize,
    /// Candidate backlog above which new diffs are processed with delay.
    #[serde(default = "default_gc_soft_limit")]
    pub throttle_soft_limit: u64,
    /// Candidate backlog above which request processing is throttled hard.
    #[serde(default = "default_gc_hard_limit")]
    pub throttle_hard_limit: u64,
    #[serde(default = "default_gc_throttle_enabled")]
    pub throttle_enabled: bool,
}

const fn default_gc_batch_size() -> usize {
    128
}

const fn default_gc_soft_limit() -> u64 {
    64 * 1024
}

const fn default_gc_hard_limit() -> u64 {
    256 * 1024
}

const fn default_gc_throttle_enabled() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkerType {
    /// Content-defined chunking with a rolling hash.
    #[default]
    RollingHash,
    /// Fixed-size chunks.
    Static,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct VolumeConfig {
    pub id: u16,
    /// Logical size in bytes, multiple of the block size.
    pub logical_size: u64,
    #[serde(default)]
    pub chunker: ChunkerType,
    /// Average chunk size for the rolling-hash chunker (power of two).
    #[serde(default = "default_avg_chunk_size")]
    pub avg_chunk_size: usize,
    #[serde(default = "default_session_count")]
    pub session_count: usize,
    /// Filter names to enable for this volume; empty means the defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

const fn default_avg_chunk_size() -> usize {
    16 * 1024
}

const fn default_session_count() -> usize {
    8
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct IdleDetectorConfig {
    /// Requests per second below which the system counts as unloaded.
    #[serde(default = "default_idle_throughput")]
    pub idle_throughput: f64,
    /// Seconds the load must stay below the threshold before idle starts.
    #[serde(default = "default_idle_duration")]
    pub idle_duration_secs: u64,
}

const fn default_idle_throughput() -> f64 {
    4.0
}

const fn default_idle_duration() -> u64 {
    5
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// Top-level engine configuration.
pub struct SystemConfig {
    /// Block size presented by all volumes, multiple of the sector size.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    pub chunk_store: ChunkStoreConfig,
    pub chunk_index: ChunkIndexConfig,
    pub block_index: BlockIndexConfig,
    pub log: LogConfig,
    pub gc: GcConfig,
    #[serde(default)]
    pub idle: IdleDetectorConfig,
    pub info_store: IndexConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeConfig>,
}

impl Default for IdleDetectorConfig {
    fn default() -> Self {
        Self {
            idle_throughput: default_idle_throughput(),
            idle_duration_secs: default_idle_duration(),
        }
    }
}

const fn default_block_size() -> usize {
    64 * 1024
}

/// Counters reported by the usage-count garbage collector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GarbageCollectionStatus {
    pub processed_diffs: u64,
    pub usage_count_updates: u64,
    pub new_candidates: u64,
    pub processed_candidates: u64,
    pub deleted_chunks: u64,
    pub skipped_in_combat: u64,
    pub skipped_busy: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        let config = SystemConfig {
            block_size: default_block_size(),
            chunk_store: ChunkStoreConfig {
                path: "/tmp/bds".to_string(),
                container_size: DEFAULT_CONTAINER_SIZE,
                container_file_count: 4,
                containers_per_file: 4096,
                write_cache_size: 8,
                write_cache_strategy: WriteCacheStrategy::EarliestFree,
                write_cache_timeout_secs: 4,
                committer_threads: 8,
                compression: CompressionType::Zstd,
                read_cache_size: 32,
                full_threshold: 0.95,
                container_index: IndexConfig::mem(),
            },
            chunk_index: ChunkIndexConfig {
                persistent: IndexConfig::mem(),
                chunk_lock_count: 1021,
                sampling_strategy: SamplingStrategy::Full,
                sampling_factor: 4,
                in_combat_capacity: 1024,
                in_combat_error_rate: 0.01,
                bg_check_interval_ms: 250,
                bg_batch_size: 64,
            },
            block_index: BlockIndexConfig {
                persistent: IndexConfig::mem(),
                block_lock_count: 1021,
                cache_size: 4096,
                bg_check_interval_ms: 250,
            },
            log: LogConfig {
                filename: vec!["/tmp/bds/log".to_string()],
                max_log_size: default_max_log_file_size(),
                replay_check_interval_ms: 100,
            },
            gc: GcConfig {
                mode: GcMode::UsageCount,
                candidate_index: IndexConfig::mem(),
                batch_size: 128,
                throttle_soft_limit: 64 * 1024,
                throttle_hard_limit: 256 * 1024,
                throttle_enabled: true,
            },
            idle: IdleDetectorConfig::default(),
            info_store: IndexConfig::mem(),
            volumes: vec![VolumeConfig {
                id: 0,
                logical_size: 1024 * 1024,
                chunker: ChunkerType::RollingHash,
                avg_chunk_size: 16 * 1024,
                session_count: 8,
                filters: Vec::new(),
            }],
        };

        let text = serde_json::to_string(&config).unwrap();
        let parsed: SystemConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.chunk_store.compression, CompressionType::Zstd);
        assert_eq!(parsed.volumes[0].id, 0);
        assert!(text.contains("write-cache-strategy"));
    }

    #[test]
    fn defaults_apply() {
        let text = r#"{
            "persistent": { "type": "mem" }
        }"#;
        let parsed: ChunkIndexConfig = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.chunk_lock_count, 1021);
        assert_eq!(parsed.sampling_strategy, SamplingStrategy::Full);
        assert_eq!(parsed.sampling_factor, 4);
    }
}
