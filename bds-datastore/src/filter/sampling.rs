//! Marks chunks as anchors under the configured sampling strategy.
//!
//! Never conclusive; it only sets the `indexed` flag that decides whether
//! the chunk index will carry the mapping.

use std::sync::Arc;

use crate::chunk_index::{ChunkIndex, ChunkMapping};
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{ErrorContext, Result};

use super::{Filter, FilterContext, FilterResult};

pub struct SamplingFilter {
    chunk_index: Arc<ChunkIndex>,
}

impl SamplingFilter {
    pub fn new(chunk_index: Arc<ChunkIndex>) -> Self {
        Self { chunk_index }
    }
}

impl Filter for SamplingFilter {
    fn name(&self) -> &'static str {
        "sampling"
    }

    fn max_result(&self) -> FilterResult {
        FilterResult::WeakMaybe
    }

    fn check(
        &self,
        _ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
        _ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        mapping.indexed = self.chunk_index.is_anchor(&mapping.fingerprint);
        Ok(FilterResult::WeakMaybe)
    }
}
