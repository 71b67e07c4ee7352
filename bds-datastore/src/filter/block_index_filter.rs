//! Duplicate detection against the block's own previous mapping.
//!
//! Overwrites frequently rewrite the same data; the prior mapping of the
//! block under modification already carries the fingerprints and
//! addresses of its chunks. An optional per-volume chunk cache remembers
//! recently written fingerprints beyond the single block.

use std::sync::Mutex;

use bds_tools::lru_cache::LruCache;

use crate::chunk_index::ChunkMapping;
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{ErrorContext, Result};
use crate::fingerprint::Fingerprint;

use super::{Filter, FilterContext, FilterResult};

pub struct BlockIndexFilter {
    chunk_cache: Option<Mutex<LruCache<Fingerprint, u64>>>,
}

impl BlockIndexFilter {
    pub fn new(chunk_cache_size: usize) -> Self {
        let chunk_cache = if chunk_cache_size > 0 {
            Some(Mutex::new(LruCache::new(chunk_cache_size)))
        } else {
            None
        };
        Self { chunk_cache }
    }
}

impl Filter for BlockIndexFilter {
    fn name(&self) -> &'static str {
        "block-index"
    }

    fn max_result(&self) -> FilterResult {
        FilterResult::StrongMaybe
    }

    fn check(
        &self,
        ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
        _ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        if let Some(block_mapping) = ctx.block_mapping {
            for item in &block_mapping.items {
                if item.fingerprint == mapping.fingerprint && !item.fingerprint.is_empty_chunk() {
                    mapping.data_address = item.data_address;
                    mapping.block_hint = Some(block_mapping.block_id);
                    return Ok(FilterResult::StrongMaybe);
                }
            }
        }
        if let Some(cache) = &self.chunk_cache {
            if let Some(address) = cache.lock().unwrap().get_mut(&mapping.fingerprint) {
                mapping.data_address = *address;
                return Ok(FilterResult::StrongMaybe);
            }
        }
        Ok(FilterResult::WeakMaybe)
    }

    fn update(
        &self,
        _ctx: &FilterContext,
        mapping: &ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
    ) -> Result<()> {
        self.update_known_chunk(_ctx, mapping)
    }

    fn update_known_chunk(&self, _ctx: &FilterContext, mapping: &ChunkMapping) -> Result<()> {
        if let Some(cache) = &self.chunk_cache {
            if mapping.has_data_address() && !mapping.fingerprint.is_empty_chunk() {
                cache
                    .lock()
                    .unwrap()
                    .insert(mapping.fingerprint, mapping.data_address);
            }
        }
        Ok(())
    }
}
