//! All-zero chunks match the reserved empty-chunk fingerprint and are
//! never stored or indexed.

use crate::chunk_index::ChunkMapping;
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{ErrorContext, Result};
use crate::EMPTY_DATA_ADDRESS;

use super::{Filter, FilterContext, FilterResult};

pub struct ZeroChunkFilter;

impl Filter for ZeroChunkFilter {
    fn name(&self) -> &'static str {
        "zero-chunk"
    }

    fn max_result(&self) -> FilterResult {
        FilterResult::Existing
    }

    fn check(
        &self,
        _ctx: &FilterContext,
        mapping: &mut ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
        _ec: &mut ErrorContext,
    ) -> Result<FilterResult> {
        if mapping.fingerprint.is_empty_chunk() {
            mapping.data_address = EMPTY_DATA_ADDRESS;
            mapping.indexed = false;
            return Ok(FilterResult::Existing);
        }
        Ok(FilterResult::WeakMaybe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    #[test]
    fn zero_data_is_existing() {
        let filter = ZeroChunkFilter;
        let ctx = FilterContext {
            volume_id: 0,
            block_mapping: None,
            chunk_data: &[0u8; 128],
        };
        let mut mapping = ChunkMapping::new(Fingerprint::empty_chunk());
        let mut ec = ErrorContext::new();
        assert_eq!(
            filter.check(&ctx, &mut mapping, None, &mut ec).unwrap(),
            FilterResult::Existing
        );
        assert_eq!(mapping.data_address, EMPTY_DATA_ADDRESS);
        assert!(!mapping.indexed);
    }

    #[test]
    fn regular_data_passes_through() {
        let filter = ZeroChunkFilter;
        let ctx = FilterContext {
            volume_id: 0,
            block_mapping: None,
            chunk_data: b"not zero",
        };
        let mut mapping = ChunkMapping::new(Fingerprint::of_data(b"not zero"));
        let mut ec = ErrorContext::new();
        assert_eq!(
            filter.check(&ctx, &mut mapping, None, &mut ec).unwrap(),
            FilterResult::WeakMaybe
        );
    }
}
