//! Deduplicating block storage engine core.
//!
//! The engine presents virtual block devices whose contents are chunked,
//! fingerprinted and stored once. All mutations of block or chunk state are
//! brokered by the operation log: components register as log consumers and
//! never call into each other for cross-component state changes.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod block_index;
pub mod block_locks;
pub mod block_mapping;
pub mod chunk;
pub mod chunk_index;
pub mod chunk_locks;
pub mod chunk_store;
pub mod chunker;
pub mod container;
pub mod container_tracker;
pub mod error;
pub mod file_formats;
pub mod filter;
pub mod fingerprint;
pub mod gc;
pub mod idle_detector;
pub mod index_factory;
pub mod info_store;
pub mod log_store;
pub mod scsi;
pub mod session;
pub mod system;
pub mod volume;

pub use block_index::BlockIndex;
pub use block_mapping::{BlockMapping, BlockMappingItem, BlockMappingPair};
pub use chunk::Chunk;
pub use chunk_index::{ChunkIndex, ChunkMapping};
pub use chunk_store::ChunkStore;
pub use chunker::{Chunker, ChunkerSession, RollingChunker, StaticChunker};
pub use container::{Container, ContainerItem};
pub use error::{DedupError, ErrorContext};
pub use fingerprint::Fingerprint;
pub use log_store::{LogEvent, OperationLog};
pub use scsi::ScsiResult;
pub use system::DedupSystem;
pub use volume::DedupVolume;

/// Data addresses are container ids with two reserved values.
pub const EMPTY_DATA_ADDRESS: u64 = 0;
pub const ILLEGAL_DATA_ADDRESS: u64 = u64::MAX;
pub const LEAST_VALID_CONTAINER_ID: u64 = 1;
