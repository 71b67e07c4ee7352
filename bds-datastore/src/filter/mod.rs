//! Duplicate classification filter chain.
//!
//! Each filter inspects a chunk mapping and reports how sure it is that
//! the chunk already exists. Evaluation short-circuits on conclusive
//! results; after a `StrongMaybe`, only filters that can still prove
//! `Existing` run. Once the chain resolves, the session calls either
//! `update` (a new chunk entered the store) or `abort` (the request
//! failed); `update_known_chunk` feeds per-block caches for every known
//! chunk written to a block.
//!
//! The per-fingerprint chunk lock is taken by the session before the
//! chain runs and held until update/abort, so index lookups and updates
//! for one fingerprint are serialized.

use std::sync::Arc;

use crate::block_mapping::BlockMapping;
use crate::chunk_index::ChunkMapping;
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{ErrorContext, Result};

mod block_index_filter;
mod bloom;
mod byte_compare;
mod chunk_index_filter;
mod sampling;
mod zero_chunk;

pub use block_index_filter::BlockIndexFilter;
pub use bloom::BloomFilter;
pub use byte_compare::ByteCompareFilter;
pub use chunk_index_filter::ChunkIndexFilter;
pub use sampling::SamplingFilter;
pub use zero_chunk::ZeroChunkFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterResult {
    /// The chunk is certainly new.
    NotExisting,
    /// No information either way.
    WeakMaybe,
    /// Duplicate with very high probability; `data_address` is set.
    StrongMaybe,
    /// Duplicate proven.
    Existing,
}

/// Read-only request state shared with the filters.
pub struct FilterContext<'a> {
    pub volume_id: u16,
    pub block_mapping: Option<&'a BlockMapping>,
    pub chunk_data: &'a [u8],
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// The strongest result this filter can return.
    fn max_result(&self) -> FilterResult;

    fn check(
        &self,
        ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        guard: Option<&ChunkLockGuard>,
        ec: &mut ErrorContext,
    ) -> Result<FilterResult>;

    /// A new chunk was stored; update persistent filter state.
    fn update(
        &self,
        _ctx: &FilterContext,
        _mapping: &ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
    ) -> Result<()> {
        Ok(())
    }

    /// A known chunk was (re-)written to a block.
    fn update_known_chunk(&self, _ctx: &FilterContext, _mapping: &ChunkMapping) -> Result<()> {
        Ok(())
    }

    /// The chain was interrupted; release per-request resources.
    fn abort(&self, _ctx: &FilterContext, _mapping: &ChunkMapping) -> Result<()> {
        Ok(())
    }
}

pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Run the chain for one chunk.
    pub fn check(
        &self,
        ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        guard: Option<&ChunkLockGuard>,
        ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        let mut strong_seen = false;
        for filter in &self.filters {
            if strong_seen && filter.max_result() < FilterResult::Existing {
                continue;
            }
            let result = filter.check(ctx, mapping, guard, ec)?;
            log::trace!("filter {} -> {result:?} for {}", filter.name(), mapping.fingerprint);
            match result {
                FilterResult::Existing => {
                    mapping.known_chunk = true;
                    return Ok(FilterResult::Existing);
                }
                FilterResult::NotExisting => return Ok(FilterResult::NotExisting),
                FilterResult::StrongMaybe => strong_seen = true,
                FilterResult::WeakMaybe => {}
            }
        }
        if strong_seen {
            mapping.known_chunk = true;
            Ok(FilterResult::StrongMaybe)
        } else {
            Ok(FilterResult::WeakMaybe)
        }
    }

    pub fn update(
        &self,
        ctx: &FilterContext,
        mapping: &ChunkMapping,
        guard: Option<&ChunkLockGuard>,
    ) -> Result<()> {
        for filter in &self.filters {
            filter.update(ctx, mapping, guard)?;
        }
        Ok(())
    }

    pub fn update_known_chunk(&self, ctx: &FilterContext, mapping: &ChunkMapping) -> Result<()> {
        for filter in &self.filters {
            filter.update_known_chunk(ctx, mapping)?;
        }
        Ok(())
    }

    pub fn abort(&self, ctx: &FilterContext, mapping: &ChunkMapping) {
        for filter in &self.filters {
            if let Err(err) = filter.abort(ctx, mapping) {
                log::warn!("filter {} abort failed - {err}", filter.name());
            }
        }
    }
}
