//! Fingerprint lookup against the chunk index.
//!
//! A hit is `StrongMaybe` (only a byte compare can prove `Existing`). A
//! miss is authoritative under the full indexing strategy; under sampling
//! a miss proves nothing. The session holds the chunk lock across the
//! whole check/update window.

use std::sync::Arc;

use bds_api_types::SamplingStrategy;

use crate::chunk_index::{ChunkIndex, ChunkMapping, LookupOutcome};
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{DedupError, ErrorContext, Result};

use super::{Filter, FilterContext, FilterResult};

pub struct ChunkIndexFilter {
    chunk_index: Arc<ChunkIndex>,
    sampling_strategy: SamplingStrategy,
}

impl ChunkIndexFilter {
    pub fn new(chunk_index: Arc<ChunkIndex>, sampling_strategy: SamplingStrategy) -> Self {
        Self {
            chunk_index,
            sampling_strategy,
        }
    }
}

impl Filter for ChunkIndexFilter {
    fn name(&self) -> &'static str {
        "chunk-index"
    }

    fn max_result(&self) -> FilterResult {
        FilterResult::StrongMaybe
    }

    fn check(
        &self,
        _ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        guard: Option<&ChunkLockGuard>,
        _ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        let guard = guard.ok_or_else(|| {
            DedupError::programming("chunk index filter requires the chunk lock")
        })?;
        match self.chunk_index.lookup(mapping, guard)? {
            LookupOutcome::Found => Ok(FilterResult::StrongMaybe),
            LookupOutcome::NotFound => match self.sampling_strategy {
                // a complete index turns a miss into proof
                SamplingStrategy::Full => Ok(FilterResult::NotExisting),
                SamplingStrategy::Sampling => Ok(FilterResult::WeakMaybe),
            },
        }
    }

    fn update(
        &self,
        _ctx: &FilterContext,
        mapping: &ChunkMapping,
        guard: Option<&ChunkLockGuard>,
    ) -> Result<()> {
        let guard = guard.ok_or_else(|| {
            DedupError::programming("chunk index filter requires the chunk lock")
        })?;
        self.chunk_index.put(mapping, guard)
    }
}
