//! Inline block-level deduplicating storage engine.
//!
//! This crate re-exports the engine building blocks; the interesting code
//! lives in the member crates:
//!
//! * [`bds_datastore`] - the write/read/GC pipeline (chunk store, chunk
//!   and block indexes, operation log, filter chain, chunkers, volumes)
//! * [`bds_index`] - the uniform persistent key-value index abstraction
//! * [`bds_api_types`] - shared configuration and status types
//! * [`bds_tools`] - generic helpers (LRU cache, bloom set, ...)

pub use bds_api_types as api_types;
pub use bds_datastore as datastore;
pub use bds_index as index;
pub use bds_tools as tools;

pub use bds_datastore::{
    BlockMapping, BlockMappingPair, Chunk, ChunkMapping, DedupSystem, DedupVolume, ErrorContext,
    Fingerprint, ScsiResult,
};
pub use bds_datastore::volume::Request;
