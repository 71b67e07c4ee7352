//! Builds index back-ends from configuration.

use std::sync::Arc;

use anyhow::{bail, Error};

use bds_api_types::{IndexConfig, IndexType};
use bds_index::Index;

/// Open (creating on demand) the back-end described by `config`.
pub fn open_index(config: &IndexConfig) -> Result<Arc<dyn Index>, Error> {
    let path = || -> Result<&str, Error> {
        match config.filename.first() {
            Some(path) => Ok(path),
            None => bail!("index type {:?} requires a filename", config.index_type),
        }
    };

    let index: Arc<dyn Index> = match config.index_type {
        IndexType::Mem => Arc::new(bds_index::mem::MemIndex::new()),
        IndexType::Fixed => {
            let record_size = config
                .record_size
                .ok_or_else(|| anyhow::format_err!("fixed index requires record-size"))?;
            let shards = config.filename.len().max(1);
            Arc::new(bds_index::fixed::FixedIndex::open(path()?, shards, record_size)?)
        }
        IndexType::DiskHash => {
            Arc::new(bds_index::disk_hash::DiskHashIndex::open(path()?, config.capacity)?)
        }
        IndexType::Lsm => Arc::new(bds_index::lsm::LsmIndex::open(path()?)?),
        IndexType::Btree => Arc::new(bds_index::btree::BtreeIndex::open(path()?)?),
    };
    Ok(index)
}
