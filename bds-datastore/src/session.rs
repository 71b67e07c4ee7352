//! Per-session request processing.
//!
//! A session binds one chunker instance to the shared engine components
//! and turns block reads and writes into chunk store and index
//! operations. Within one block id, writes are serialized by the block
//! lock; the log append is the commit point of every mapping change.

use std::sync::Arc;

use crate::block_mapping::{BlockMapping, BlockMappingItem, BlockMappingPair};
use crate::chunk_index::{ChunkIndex, ChunkMapping};
use crate::chunk_store::ChunkStore;
use crate::chunker::ChunkerSession;
use crate::error::{DedupError, ErrorContext, Result};
use crate::filter::{FilterChain, FilterContext, FilterResult};
use crate::log_store::{LogEvent, OperationLog};
use crate::block_index::BlockIndex;
use crate::EMPTY_DATA_ADDRESS;

/// Shared component references handed to sessions and volumes.
pub struct EngineRefs {
    pub block_size: usize,
    pub store: Arc<ChunkStore>,
    pub chunk_index: Arc<ChunkIndex>,
    pub block_index: Arc<BlockIndex>,
    pub log: Arc<OperationLog>,
}

pub struct Session {
    volume_id: u16,
    chunker: Box<dyn ChunkerSession>,
    chain: Arc<FilterChain>,
    refs: Arc<EngineRefs>,
}

impl Session {
    pub fn new(
        volume_id: u16,
        chunker: Box<dyn ChunkerSession>,
        chain: Arc<FilterChain>,
        refs: Arc<EngineRefs>,
    ) -> Self {
        Self {
            volume_id,
            chunker,
            chain,
            refs,
        }
    }

    /// Write `data` at the volume byte offset; `base_block` is the
    /// volume's first block id.
    pub fn handle_write(
        &mut self,
        base_block: u64,
        offset: u64,
        data: &[u8],
        ec: &mut ErrorContext,
    ) -> Result<()> {
        let block_size = self.refs.block_size as u64;
        let mut cursor = 0usize;
        let mut position = offset;
        while cursor < data.len() {
            let block_id = base_block + position / block_size;
            let block_offset = (position % block_size) as usize;
            let take = (block_size as usize - block_offset).min(data.len() - cursor);
            self.write_block(block_id, block_offset, &data[cursor..cursor + take], ec)?;
            cursor += take;
            position += take as u64;
        }
        Ok(())
    }

    pub fn handle_read(
        &mut self,
        base_block: u64,
        offset: u64,
        buf: &mut [u8],
        ec: &mut ErrorContext,
    ) -> Result<()> {
        let block_size = self.refs.block_size as u64;
        let mut cursor = 0usize;
        let mut position = offset;
        while cursor < buf.len() {
            let block_id = base_block + position / block_size;
            let block_offset = (position % block_size) as usize;
            let take = (block_size as usize - block_offset).min(buf.len() - cursor);
            self.read_block(block_id, block_offset, &mut buf[cursor..cursor + take], ec)?;
            cursor += take;
            position += take as u64;
        }
        Ok(())
    }

    fn write_block(
        &mut self,
        block_id: u64,
        block_offset: usize,
        data: &[u8],
        ec: &mut ErrorContext,
    ) -> Result<()> {
        let block_size = self.refs.block_size;
        let guard = self.refs.block_index.locks().lock(block_id);
        let old = self.refs.block_index.read_mapping(block_id, block_size, &guard)?;

        // partial writes merge into the current block content
        let block_data = if block_offset == 0 && data.len() == block_size {
            data.to_vec()
        } else {
            let mut buf = self.read_mapping_data(&old, ec)?;
            buf[block_offset..block_offset + data.len()].copy_from_slice(data);
            buf
        };

        let mut chunks = Vec::new();
        self.chunker.chunk_data(&block_data, true, &mut chunks)?;

        let mut items = Vec::with_capacity(chunks.len());
        let mut processed = Vec::with_capacity(chunks.len());
        let mut chunk_offset_in_block = 0usize;
        for mut chunk in chunks {
            let fingerprint = chunk.fingerprint();
            let size = chunk.len() as u32;
            let chunk_data = &block_data[chunk_offset_in_block..chunk_offset_in_block + chunk.len()];
            let mapping = self.process_chunk(chunk_data, fingerprint, &old, ec)?;
            items.push(BlockMappingItem {
                fingerprint,
                chunk_offset: 0,
                size,
                data_address: mapping.data_address,
            });
            processed.push(mapping);
            chunk_offset_in_block += size as usize;
        }

        let mut updated = BlockMapping {
            block_id,
            block_size,
            version: old.version + 1,
            event_log_id: 0,
            items,
        };
        if !updated.check() {
            return Err(DedupError::programming(format!(
                "chunking of block {block_id} does not cover the block"
            )));
        }

        let pair = BlockMappingPair::from_mappings(&old, &updated);
        let log_id = match self.refs.log.append(LogEvent::BlockMappingWritten { pair: pair.clone() })
        {
            Ok(log_id) => log_id,
            Err(err) => {
                ec.set_write_error();
                // tell replay consumers the counts of this pair are void
                let _ = self
                    .refs
                    .log
                    .append(LogEvent::BlockMappingWriteFailed { pair });
                return Err(err);
            }
        };
        updated.event_log_id = log_id;
        self.refs.block_index.store_mapping(updated, &guard)?;

        // let per-block caches learn about every known chunk of the block
        let ctx = FilterContext {
            volume_id: self.volume_id,
            block_mapping: Some(&old),
            chunk_data: &[],
        };
        for mapping in processed.iter().filter(|mapping| mapping.known_chunk) {
            self.chain.update_known_chunk(&ctx, mapping)?;
        }
        Ok(())
    }

    /// Classify one chunk and make sure its bytes are stored.
    fn process_chunk(
        &self,
        data: &[u8],
        fingerprint: crate::fingerprint::Fingerprint,
        old_mapping: &BlockMapping,
        ec: &mut ErrorContext,
    ) -> Result<ChunkMapping> {
        let mut mapping = ChunkMapping::new(fingerprint);
        let ctx = FilterContext {
            volume_id: self.volume_id,
            block_mapping: Some(old_mapping),
            chunk_data: data,
        };

        let guard = self.refs.chunk_index.locks().lock(&fingerprint);
        let result = match self.chain.check(&ctx, &mut mapping, Some(&guard), ec) {
            Ok(result) => result,
            Err(err) => {
                self.chain.abort(&ctx, &mapping);
                ec.record(&err);
                return Err(err);
            }
        };

        match result {
            FilterResult::Existing | FilterResult::StrongMaybe => {
                mapping.known_chunk = true;
                Ok(mapping)
            }
            FilterResult::NotExisting | FilterResult::WeakMaybe => {
                let address =
                    match self
                        .refs
                        .store
                        .write_new(&fingerprint, data, mapping.indexed, ec)
                    {
                        Ok(address) => address,
                        Err(err) => {
                            self.chain.abort(&ctx, &mapping);
                            return Err(err);
                        }
                    };
                mapping.data_address = address;
                if let Err(err) = self.chain.update(&ctx, &mapping, Some(&guard)) {
                    self.chain.abort(&ctx, &mapping);
                    return Err(err);
                }
                Ok(mapping)
            }
        }
    }

    fn read_block(
        &mut self,
        block_id: u64,
        block_offset: usize,
        buf: &mut [u8],
        ec: &mut ErrorContext,
    ) -> Result<()> {
        let block_size = self.refs.block_size;
        let guard = self.refs.block_index.locks().lock(block_id);
        let mapping = self.refs.block_index.read_mapping(block_id, block_size, &guard)?;
        drop(guard);

        buf.fill(0);
        let want = block_offset..block_offset + buf.len();
        let mut item_start = 0usize;
        for item in &mapping.items {
            let item_end = item_start + item.size as usize;
            let overlap_start = want.start.max(item_start);
            let overlap_end = want.end.min(item_end);
            if overlap_start < overlap_end && !item.fingerprint.is_empty_chunk() {
                let bytes = match self.refs.store.read(item.data_address, &item.fingerprint) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        ec.set_read_error();
                        return Err(err);
                    }
                };
                let slice_start = item.chunk_offset as usize + (overlap_start - item_start);
                let slice_end = slice_start + (overlap_end - overlap_start);
                if slice_end > bytes.len() {
                    return Err(DedupError::integrity(format!(
                        "block {block_id} references bytes beyond chunk {}",
                        item.fingerprint
                    )));
                }
                buf[overlap_start - want.start..overlap_end - want.start]
                    .copy_from_slice(&bytes[slice_start..slice_end]);
            }
            item_start = item_end;
        }
        Ok(())
    }

    /// Assemble a block's full current content.
    fn read_mapping_data(&self, mapping: &BlockMapping, ec: &mut ErrorContext) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; mapping.block_size];
        let mut at = 0usize;
        for item in &mapping.items {
            let size = item.size as usize;
            if !item.fingerprint.is_empty_chunk() && item.data_address != EMPTY_DATA_ADDRESS {
                let bytes = match self.refs.store.read(item.data_address, &item.fingerprint) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        ec.set_read_error();
                        return Err(err);
                    }
                };
                let start = item.chunk_offset as usize;
                if start + size > bytes.len() {
                    return Err(DedupError::integrity(format!(
                        "block {} references bytes beyond chunk {}",
                        mapping.block_id, item.fingerprint
                    )));
                }
                buf[at..at + size].copy_from_slice(&bytes[start..start + size]);
            }
            at += size;
        }
        Ok(buf)
    }
}

/// Clone one block's mapping from source to target without touching chunk
/// data; the logged pair raises the usage counts of the referenced chunks.
pub fn fast_copy_block(
    refs: &EngineRefs,
    src_block: u64,
    tgt_block: u64,
) -> Result<()> {
    let block_size = refs.block_size;
    debug_assert_ne!(src_block, tgt_block);

    let (first, second) = if src_block < tgt_block {
        (src_block, tgt_block)
    } else {
        (tgt_block, src_block)
    };
    let guard = refs.block_index.locks().lock_pair(first, second);

    let source = refs.block_index.read_mapping(src_block, block_size, &guard)?;
    let old_target = refs.block_index.read_mapping(tgt_block, block_size, &guard)?;

    let mut updated = BlockMapping {
        block_id: tgt_block,
        block_size,
        version: old_target.version + 1,
        event_log_id: 0,
        items: source.items.clone(),
    };

    let pair = BlockMappingPair::from_mappings(&old_target, &updated);
    let log_id = refs.log.append(LogEvent::BlockMappingWritten { pair })?;
    updated.event_log_id = log_id;
    refs.block_index.store_mapping(updated, &guard)?;
    Ok(())
}
