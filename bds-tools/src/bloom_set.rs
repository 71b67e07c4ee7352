//! Probabilistic membership set (bloom filter).
//!
//! Sized from an expected item count and a target false-positive rate.
//! Supports clearing, but no per-item removal.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

pub struct BloomSet {
    bits: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
    item_count: u64,
}

impl BloomSet {
    /// Create a set for `capacity` expected items with the given target
    /// false-positive rate.
    pub fn with_error_rate(capacity: u64, error_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let error_rate = error_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let bit_count = (-(capacity as f64) * error_rate.ln() / (ln2 * ln2)).ceil() as u64;
        let hash_count = ((bit_count as f64 / capacity as f64) * ln2).round().max(1.0) as u32;
        Self::with_size(bit_count, hash_count)
    }

    /// Create a set with an explicit bit and hash function count.
    pub fn with_size(bit_count: u64, hash_count: u32) -> Self {
        let bit_count = bit_count.max(64);
        let words = bit_count.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            bit_count,
            hash_count: hash_count.max(1),
            item_count: 0,
        }
    }

    fn bit_positions(&self, data: &[u8]) -> impl Iterator<Item = u64> + '_ {
        // double hashing: g_i(x) = h1(x) + i * h2(x)
        let mut hasher = SipHasher13::new_with_keys(0x5ca1ab1e, 0x0ddba11);
        hasher.write(data);
        let h1 = hasher.finish();
        let mut hasher = SipHasher13::new_with_keys(0xdeadbeef, 0xfeedface);
        hasher.write(data);
        let h2 = hasher.finish() | 1;
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    pub fn insert(&mut self, data: &[u8]) {
        let positions: Vec<u64> = self.bit_positions(data).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
        self.item_count += 1;
    }

    /// Check membership. False positives are possible, false negatives are
    /// not.
    pub fn contains(&self, data: &[u8]) -> bool {
        self.bit_positions(data)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.item_count = 0;
    }

    /// Number of insert calls since creation or the last clear.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_contains() {
        let mut set = BloomSet::with_error_rate(1024, 0.01);
        for i in 0u64..512 {
            set.insert(&i.to_le_bytes());
        }
        for i in 0u64..512 {
            assert!(set.contains(&i.to_le_bytes()));
        }
    }

    #[test]
    fn error_rate_is_bounded() {
        let mut set = BloomSet::with_error_rate(4096, 0.01);
        for i in 0u64..4096 {
            set.insert(&i.to_le_bytes());
        }
        let mut false_positives = 0;
        for i in 100_000u64..110_000 {
            if set.contains(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        // 1% target, allow generous slack
        assert!(false_positives < 500, "false positives: {false_positives}");
    }

    #[test]
    fn clear_resets() {
        let mut set = BloomSet::with_error_rate(64, 0.01);
        set.insert(b"alpha");
        assert!(set.contains(b"alpha"));
        set.clear();
        assert!(!set.contains(b"alpha"));
        assert_eq!(set.item_count(), 0);
    }
}
