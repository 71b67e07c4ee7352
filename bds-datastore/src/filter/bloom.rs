//! Bloom-set membership pre-filter.
//!
//! A negative is authoritative (`NotExisting`), a positive says nothing.
//! The set is best-effort state: it is rebuilt from the chunk index at
//! startup and never persisted.

use std::sync::Mutex;

use bds_tools::bloom_set::BloomSet;

use crate::chunk_index::ChunkMapping;
use crate::chunk_locks::ChunkLockGuard;
use crate::error::{ErrorContext, Result};
use crate::fingerprint::Fingerprint;

use super::{Filter, FilterContext, FilterResult};

pub struct BloomFilter {
    set: Mutex<BloomSet>,
}

impl BloomFilter {
    pub fn new(capacity: u64, error_rate: f64) -> Self {
        Self {
            set: Mutex::new(BloomSet::with_error_rate(capacity, error_rate)),
        }
    }

    /// Seed the set with the already indexed fingerprints.
    pub fn rebuild(&self, fingerprints: &[Fingerprint]) {
        let mut set = self.set.lock().unwrap();
        set.clear();
        for fingerprint in fingerprints {
            set.insert(fingerprint.as_bytes());
        }
        log::info!("bloom filter rebuilt from {} fingerprints", fingerprints.len());
    }
}

impl Filter for BloomFilter {
    fn name(&self) -> &'static str {
        "bloom"
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
        if self.set.lock().unwrap().contains(mapping.fingerprint.as_bytes()) {
            Ok(FilterResult::WeakMaybe)
        } else {
            Ok(FilterResult::NotExisting)
        }
    }

    fn update(
        &self,
        _ctx: &FilterContext,
        mapping: &ChunkMapping,
        _guard: Option<&ChunkLockGuard>,
    ) -> Result<()> {
        self.set.lock().unwrap().insert(mapping.fingerprint.as_bytes());
        Ok(())
    }
}
