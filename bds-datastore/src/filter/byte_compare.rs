//! Byte-wise comparison against the stored candidate chunk.
//!
//! The only filter that can turn a `StrongMaybe` into certainty: it reads
//! the candidate from the chunk store and compares the raw bytes, ruling
//! out fingerprint collisions.

use std::sync::Arc;

use crate::chunk_index::ChunkMapping;
use crate::chunk_locks::ChunkLockGuard;
use crate::chunk_store::ChunkStore;
use crate::error::{ErrorContext, Result};

use super::{Filter, FilterContext, FilterResult};

pub struct ByteCompareFilter {
    store: Arc<ChunkStore>,
}

impl ByteCompareFilter {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }
}

impl Filter for ByteCompareFilter {
    fn name(&self) -> &'static str {
        "byte-compare"
    }

    fn max_result(&self) -> FilterResult {
        FilterResult::Existing
    }

    fn check(
        &self,
        ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
        ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        if !mapping.has_data_address() || mapping.fingerprint.is_empty_chunk() {
            // no candidate to compare against
            return Ok(FilterResult::WeakMaybe);
        }
        let stored = match self.store.read(mapping.data_address, &mapping.fingerprint) {
            Ok(stored) => stored,
            Err(err) => {
                ec.set_read_error();
                return Err(err);
            }
        };
        if stored == ctx.chunk_data {
            Ok(FilterResult::Existing)
        } else {
            log::warn!(
                "fingerprint collision or corruption for {}: stored bytes differ",
                mapping.fingerprint
            );
            Ok(FilterResult::NotExisting)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::log_store::OperationLog;
    use bds_api_types::{
        ChunkStoreConfig, CompressionType, IndexConfig, LogConfig, WriteCacheStrategy,
    };

    #[test]
    fn matching_bytes_prove_existing() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-bytecmp-{}", std::process::id()));
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
            containers_per_file: 16,
            write_cache_size: 2,
            write_cache_strategy: WriteCacheStrategy::EarliestFree,
            write_cache_timeout_secs: 0,
            committer_threads: 1,
            compression: CompressionType::None,
            read_cache_size: 4,
            full_threshold: 0.95,
            container_index: IndexConfig::mem(),
        };
        let store = Arc::new(ChunkStore::open(&store_config, log.clone()).unwrap());

        let data = b"compare me".to_vec();
        let fp = Fingerprint::of_data(&data);
        let mut ec = ErrorContext::new();
        let address = store.write_new(&fp, &data, true, &mut ec).unwrap();

        let filter = ByteCompareFilter::new(store.clone());
        let ctx = FilterContext {
            volume_id: 0,
            block_mapping: None,
            chunk_data: &data,
        };
        let mut mapping = ChunkMapping::new(fp);
        mapping.data_address = address;
        assert_eq!(
            filter.check(&ctx, &mut mapping, None, &mut ec).unwrap(),
            FilterResult::Existing
        );

        // different bytes with the same candidate address: new chunk
        let other_ctx = FilterContext {
            volume_id: 0,
            block_mapping: None,
            chunk_data: b"different!",
        };
        let mut other = ChunkMapping::new(fp);
        other.data_address = address;
        assert_eq!(
            filter.check(&other_ctx, &mut other, None, &mut ec).unwrap(),
            FilterResult::NotExisting
        );

        store.stop().unwrap();
        log.stop().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
