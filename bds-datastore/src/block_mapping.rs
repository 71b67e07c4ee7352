//! Block mappings and their log-friendly transition encoding.
//!
//! A block mapping lists which chunk slices make up a block. A mapping
//! transition is logged as a [`BlockMappingPair`]: per fingerprint of the
//! old or new mapping one record with a usage count modifier, from which
//! the garbage collector derives reference count changes and the new
//! mapping can be reconstructed exactly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::{EMPTY_DATA_ADDRESS, ILLEGAL_DATA_ADDRESS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMappingItem {
    pub fingerprint: Fingerprint,
    /// Offset of the used slice inside the chunk.
    pub chunk_offset: u32,
    /// Bytes of the chunk used by this item.
    pub size: u32,
    pub data_address: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    pub block_id: u64,
    pub block_size: usize,
    /// Incremented on every successful update of the block.
    pub version: u32,
    pub event_log_id: u64,
    pub items: Vec<BlockMappingItem>,
}

impl BlockMapping {
    /// The initial state of a block: one slice of the empty chunk.
    pub fn new(block_id: u64, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            version: 0,
            event_log_id: 0,
            items: vec![BlockMappingItem {
                fingerprint: Fingerprint::empty_chunk(),
                chunk_offset: 0,
                size: block_size as u32,
                data_address: EMPTY_DATA_ADDRESS,
            }],
        }
    }

    /// The item sizes must cover the block exactly.
    pub fn check(&self) -> bool {
        let total: u64 = self.items.iter().map(|item| item.size as u64).sum();
        total == self.block_size as u64
    }

    /// Whether the block holds only zero data.
    pub fn is_empty_data(&self) -> bool {
        self.items.iter().all(|item| item.fingerprint.is_empty_chunk())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMappingPairItem {
    pub fingerprint: Fingerprint,
    pub data_address: u64,
    pub chunk_offset: u32,
    /// Zero for records that only carry a usage count change for a
    /// fingerprint no longer present in the new mapping.
    pub size: u32,
    pub usage_count_modifier: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMappingPair {
    pub block_id: u64,
    pub block_size: usize,
    pub version: u32,
    pub items: Vec<BlockMappingPairItem>,
}

impl BlockMappingPair {
    /// Encode the transition `original -> updated`.
    pub fn from_mappings(original: &BlockMapping, updated: &BlockMapping) -> Self {
        debug_assert_eq!(original.block_id, updated.block_id);
        debug_assert_eq!(original.block_size, updated.block_size);
        debug_assert!(original.check(), "illegal original mapping");
        debug_assert!(updated.check(), "illegal updated mapping");

        let mut uc_map: HashMap<Fingerprint, i32> = HashMap::new();
        let mut address_map: HashMap<Fingerprint, u64> = HashMap::new();

        for item in original.items.iter().filter(|item| item.size > 0) {
            *uc_map.entry(item.fingerprint).or_insert(0) -= 1;
            address_map.insert(item.fingerprint, item.data_address);
        }
        for item in updated.items.iter().filter(|item| item.size > 0) {
            *uc_map.entry(item.fingerprint).or_insert(0) += 1;
            address_map.insert(item.fingerprint, item.data_address);
        }

        let mut items = Vec::new();
        for item in updated.items.iter().filter(|item| item.size > 0) {
            // the first occurrence of a fingerprint carries its modifier
            let modifier = uc_map.remove(&item.fingerprint).unwrap_or(0);
            items.push(BlockMappingPairItem {
                fingerprint: item.fingerprint,
                data_address: item.data_address,
                chunk_offset: item.chunk_offset,
                size: item.size,
                usage_count_modifier: modifier,
            });
        }

        // fingerprints only present in the old mapping
        let mut leftovers: Vec<(Fingerprint, i32)> = uc_map.into_iter().collect();
        leftovers.sort_by_key(|(fp, _)| *fp);
        for (fingerprint, modifier) in leftovers {
            if fingerprint.is_empty_chunk() {
                continue;
            }
            items.push(BlockMappingPairItem {
                fingerprint,
                data_address: address_map.get(&fingerprint).copied().unwrap_or(ILLEGAL_DATA_ADDRESS),
                chunk_offset: 0,
                size: 0,
                usage_count_modifier: modifier,
            });
        }

        Self {
            block_id: updated.block_id,
            block_size: updated.block_size,
            version: updated.version,
            items,
        }
    }

    /// Reconstruct the updated mapping exactly.
    pub fn modified_mapping(&self, event_log_id: u64) -> BlockMapping {
        let items = self
            .items
            .iter()
            .filter(|item| item.size > 0)
            .map(|item| BlockMappingItem {
                fingerprint: item.fingerprint,
                chunk_offset: item.chunk_offset,
                size: item.size,
                data_address: item.data_address,
            })
            .collect();
        BlockMapping {
            block_id: self.block_id,
            block_size: self.block_size,
            version: self.version,
            event_log_id,
            items,
        }
    }

    /// Net usage count change per fingerprint, with the data address to use
    /// for new entries. Zero deltas and the reserved empty chunk are
    /// omitted.
    pub fn diff(&self) -> HashMap<Fingerprint, (i32, u64)> {
        let mut deltas: HashMap<Fingerprint, i32> = HashMap::new();
        let mut addresses: HashMap<Fingerprint, u64> = HashMap::new();
        for item in &self.items {
            *deltas.entry(item.fingerprint).or_insert(0) += item.usage_count_modifier;
            addresses.insert(item.fingerprint, item.data_address);
        }
        deltas
            .into_iter()
            .filter(|(fp, delta)| *delta != 0 && !fp.is_empty_chunk())
            .map(|(fp, delta)| (fp, (delta, addresses[&fp])))
            .collect()
    }

    pub fn modifier_sum(&self) -> i64 {
        self.items.iter().map(|item| item.usage_count_modifier as i64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(tag: u8, size: u32, address: u64) -> BlockMappingItem {
        BlockMappingItem {
            fingerprint: Fingerprint::of_data(&[tag]),
            chunk_offset: 0,
            size,
            data_address: address,
        }
    }

    #[test]
    fn initial_mapping_is_empty_data() {
        let mapping = BlockMapping::new(3, 64 * 1024);
        assert!(mapping.check());
        assert!(mapping.is_empty_data());
        assert_eq!(mapping.items[0].data_address, EMPTY_DATA_ADDRESS);
    }

    #[test]
    fn reconstruction_round_trip() {
        let block_size = 8192;
        let mut old = BlockMapping::new(1, block_size);
        old.version = 3;
        old.items = vec![item(1, 4096, 10), item(2, 4096, 11)];

        let mut new = BlockMapping::new(1, block_size);
        new.version = 4;
        new.items = vec![item(2, 4096, 11), item(3, 4096, 12)];

        let pair = BlockMappingPair::from_mappings(&old, &new);
        let rebuilt = pair.modified_mapping(99);
        assert_eq!(rebuilt.items, new.items);
        assert_eq!(rebuilt.version, 4);
        assert_eq!(rebuilt.event_log_id, 99);

        // same cardinality on both sides, so the modifiers balance
        assert_eq!(pair.modifier_sum(), 0);
    }

    #[test]
    fn diff_tracks_reference_changes() {
        let block_size = 8192;
        let mut old = BlockMapping::new(1, block_size);
        old.items = vec![item(1, 4096, 10), item(2, 4096, 11)];

        let mut new = BlockMapping::new(1, block_size);
        new.version = 1;
        new.items = vec![item(2, 4096, 11), item(3, 4096, 12)];

        let diff = BlockMappingPair::from_mappings(&old, &new).diff();
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[&Fingerprint::of_data(&[1])], (-1, 10));
        assert_eq!(diff[&Fingerprint::of_data(&[3])], (1, 12));
        assert!(!diff.contains_key(&Fingerprint::of_data(&[2])));
    }

    #[test]
    fn first_write_counts_against_empty_block() {
        let block_size = 4096;
        let old = BlockMapping::new(7, block_size);
        let mut new = BlockMapping::new(7, block_size);
        new.version = 1;
        new.items = vec![item(9, 4096, 42)];

        let pair = BlockMappingPair::from_mappings(&old, &new);
        // the empty chunk never appears as a leftover record
        assert_eq!(pair.items.len(), 1);
        assert_eq!(pair.items[0].usage_count_modifier, 1);

        let diff = pair.diff();
        assert_eq!(diff[&Fingerprint::of_data(&[9])], (1, 42));
    }

    #[test]
    fn duplicate_fingerprints_in_one_block() {
        let block_size = 8192;
        let old = BlockMapping::new(5, block_size);
        let mut new = BlockMapping::new(5, block_size);
        new.version = 1;
        // the same chunk referenced twice within one block
        new.items = vec![item(4, 4096, 20), item(4, 4096, 20)];

        let pair = BlockMappingPair::from_mappings(&old, &new);
        let diff = pair.diff();
        assert_eq!(diff[&Fingerprint::of_data(&[4])], (2, 20));

        let rebuilt = pair.modified_mapping(1);
        assert_eq!(rebuilt.items.len(), 2);
        assert!(rebuilt.check());
    }

    #[test]
    fn serde_round_trip() {
        let mut old = BlockMapping::new(1, 4096);
        old.items = vec![item(1, 4096, 10)];
        let mut new = BlockMapping::new(1, 4096);
        new.items = vec![item(2, 4096, 11)];
        let pair = BlockMappingPair::from_mappings(&old, &new);

        let json = serde_json::to_string(&pair).unwrap();
        let back: BlockMappingPair = serde_json::from_str(&json).unwrap();
        assert_eq!(pair, back);
    }
}
