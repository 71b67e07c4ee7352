//! Crash consistency: state after a hard stop and restart is a prefix of
//! the pre-crash state, with no dangling references.

use std::path::PathBuf;
use std::time::Duration;

use blockdedup::api_types::{
    BlockIndexConfig, ChunkIndexConfig, ChunkStoreConfig, ChunkerType, CompressionType, GcConfig,
    GcMode, IdleDetectorConfig, IndexConfig, IndexType, LogConfig, SamplingStrategy, SystemConfig,
    VolumeConfig, WriteCacheStrategy,
};
use blockdedup::{DedupSystem, ErrorContext, Request};

const BLOCK_SIZE: usize = 64 * 1024;

fn testdir(name: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut dir = std::env::temp_dir();
    dir.push(format!("bds-crash-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// All state on disk, so a second system instance sees what the first one
/// persisted (and nothing more).
fn persistent_config(dir: &PathBuf) -> SystemConfig {
    let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
    SystemConfig {
        block_size: BLOCK_SIZE,
        chunk_store: ChunkStoreConfig {
            path: path("chunks"),
            container_size: 1024 * 1024,
            container_file_count: 2,
            containers_per_file: 32,
            write_cache_size: 2,
            write_cache_strategy: WriteCacheStrategy::EarliestFree,
            write_cache_timeout_secs: 3600,
            committer_threads: 1,
            compression: CompressionType::None,
            read_cache_size: 8,
            full_threshold: 0.95,
            container_index: IndexConfig::new(IndexType::DiskHash, path("container-index")),
        },
        chunk_index: ChunkIndexConfig {
            persistent: IndexConfig::new(IndexType::DiskHash, path("chunk-index")),
            chunk_lock_count: 64,
            sampling_strategy: SamplingStrategy::Full,
            sampling_factor: 4,
            in_combat_capacity: 1024,
            in_combat_error_rate: 0.01,
            bg_check_interval_ms: 10,
            bg_batch_size: 16,
        },
        block_index: BlockIndexConfig {
            persistent: IndexConfig::new(IndexType::DiskHash, path("block-index")),
            block_lock_count: 64,
            cache_size: 16,
            bg_check_interval_ms: 10,
        },
        log: LogConfig {
            filename: vec![path("log-0.seg"), path("log-1.seg")],
            max_log_size: 4 << 20,
            replay_check_interval_ms: 5,
        },
        gc: GcConfig {
            mode: GcMode::UsageCount,
            // disk-hash here: the "crashed" first instance stays alive in
            // this process, and locking back-ends refuse a second open
            candidate_index: IndexConfig::new(IndexType::DiskHash, path("gc-candidates")),
            batch_size: 32,
            throttle_soft_limit: 1024,
            throttle_hard_limit: 4096,
            throttle_enabled: true,
        },
        idle: IdleDetectorConfig {
            idle_throughput: 1.0,
            idle_duration_secs: 3600,
        },
        info_store: IndexConfig::new(IndexType::DiskHash, path("info")),
        volumes: vec![VolumeConfig {
            id: 0,
            logical_size: 1 << 20,
            chunker: ChunkerType::RollingHash,
            avg_chunk_size: 16 * 1024,
            session_count: 2,
            filters: Vec::new(),
        }],
    }
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..BLOCK_SIZE)
        .map(|i| seed.wrapping_add((i % 239) as u8) | 1)
        .collect()
}

#[test]
fn uncommitted_write_reads_as_zeros_after_restart() {
    let dir = testdir("uncommitted");

    {
        let system = DedupSystem::new(persistent_config(&dir)).unwrap();
        system.start().unwrap();
        let data = pattern(3);
        let mut ec = ErrorContext::new();
        assert!(system
            .make_request(0, Request::Write { offset: 0, data: &data }, &mut ec)
            .is_ok());
        // quiesce the replay thread, then drop without flush or clean
        // shutdown; the open container with the chunk data never reaches
        // the disk
        assert!(system.log().wait_replayed(Duration::from_secs(10)));
        drop(system);
    }

    let system = DedupSystem::new(persistent_config(&dir)).unwrap();
    system.start().unwrap();

    let mut buf = vec![0xffu8; BLOCK_SIZE];
    let mut ec = ErrorContext::new();
    let result = system.make_request(0, Request::Read { offset: 0, buf: &mut buf }, &mut ec);
    assert!(result.is_ok(), "read after recovery failed: {result}");
    assert!(
        buf.iter().all(|&byte| byte == 0),
        "uncommitted write must not be visible after recovery"
    );

    system.stop(false).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn committed_write_survives_restart() {
    let dir = testdir("committed");
    let committed = pattern(5);
    let lost = pattern(9);

    {
        let system = DedupSystem::new(persistent_config(&dir)).unwrap();
        system.start().unwrap();
        let mut ec = ErrorContext::new();
        assert!(system
            .make_request(0, Request::Write { offset: 0, data: &committed }, &mut ec)
            .is_ok());
        // push the container holding block 0 to disk
        system.refs().store.flush().unwrap();

        assert!(system
            .make_request(
                0,
                Request::Write {
                    offset: BLOCK_SIZE as u64,
                    data: &lost
                },
                &mut ec
            )
            .is_ok());
        // block 1's container stays in the write cache; hard stop
        assert!(system.log().wait_replayed(Duration::from_secs(10)));
        drop(system);
    }

    let system = DedupSystem::new(persistent_config(&dir)).unwrap();
    system.start().unwrap();
    let mut ec = ErrorContext::new();

    // the committed block is fully recovered from the log
    let mut buf = vec![0u8; BLOCK_SIZE];
    assert!(system
        .make_request(0, Request::Read { offset: 0, buf: &mut buf }, &mut ec)
        .is_ok());
    assert_eq!(buf, committed);

    // the block whose container was lost reads as zeros (prefix state)
    let mut buf = vec![0xffu8; BLOCK_SIZE];
    assert!(system
        .make_request(
            0,
            Request::Read {
                offset: BLOCK_SIZE as u64,
                buf: &mut buf
            },
            &mut ec
        )
        .is_ok());
    assert!(buf.iter().all(|&byte| byte == 0));

    system.stop(false).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn clean_restart_preserves_everything() {
    let dir = testdir("clean");
    let data = pattern(7);

    {
        let system = DedupSystem::new(persistent_config(&dir)).unwrap();
        system.start().unwrap();
        let mut ec = ErrorContext::new();
        assert!(system
            .make_request(0, Request::Write { offset: 0, data: &data }, &mut ec)
            .is_ok());
        assert!(system.log().wait_replayed(Duration::from_secs(10)));
        system.stop(false).unwrap();
    }

    let system = DedupSystem::new(persistent_config(&dir)).unwrap();
    system.start().unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut ec = ErrorContext::new();
    assert!(system
        .make_request(0, Request::Read { offset: 0, buf: &mut buf }, &mut ec)
        .is_ok());
    assert_eq!(buf, data);
    system.stop(false).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
