//! Chunk fingerprints.
//!
//! A fingerprint is the SHA-256 digest of the chunk bytes. Two values are
//! reserved: the empty-chunk fingerprint stands for all-zero content of any
//! length and is never indexed; the all-zero sentinel marks uninitialized
//! mappings and is never persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 of the empty input; reserved for all-zero chunk content. Chunks
/// are at least one byte long, so no real chunk ever hashes to this value.
pub const EMPTY_CHUNK_FINGERPRINT: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
];

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "hex::serde")] [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub const fn new(digest: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(digest)
    }

    pub const fn empty_chunk() -> Self {
        Self(EMPTY_CHUNK_FINGERPRINT)
    }

    /// The uninitialized sentinel; never persisted.
    pub const fn uninitialized() -> Self {
        Self([0u8; FINGERPRINT_SIZE])
    }

    pub fn of_data(data: &[u8]) -> Self {
        Self(openssl::sha::sha256(data))
    }

    pub fn is_empty_chunk(&self) -> bool {
        self.0 == EMPTY_CHUNK_FINGERPRINT
    }

    pub fn is_uninitialized(&self) -> bool {
        self.0 == [0u8; FINGERPRINT_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, anyhow::Error> {
        let digest: [u8; FINGERPRINT_SIZE] = data
            .try_into()
            .map_err(|_| anyhow::format_err!("invalid fingerprint length {}", data.len()))?;
        Ok(Self(digest))
    }

    /// Sampling predicate: the chunk is an anchor when the low bits of the
    /// fingerprint suffix are zero. `factor` must be a power of two.
    pub fn matches_sampling_mask(&self, factor: u64) -> bool {
        if factor <= 1 {
            return true;
        }
        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&self.0[FINGERPRINT_SIZE - 8..]);
        u64::from_le_bytes(suffix) & (factor - 1) == 0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty_chunk() {
            return write!(f, "<empty>");
        }
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_constant_matches_openssl() {
        assert_eq!(openssl::sha::sha256(b""), EMPTY_CHUNK_FINGERPRINT);
    }

    #[test]
    fn digest_is_stable() {
        let fp = Fingerprint::of_data(b"hello world");
        assert_eq!(fp, Fingerprint::of_data(b"hello world"));
        assert_ne!(fp, Fingerprint::of_data(b"hello worlt"));
        assert!(!fp.is_empty_chunk());
        assert!(!fp.is_uninitialized());
    }

    #[test]
    fn sampling_mask() {
        // factor 1 matches everything
        let fp = Fingerprint::of_data(b"data");
        assert!(fp.matches_sampling_mask(1));

        // factor 4 matches ~1/4 of fingerprints
        let mut hits = 0;
        for i in 0u64..4096 {
            if Fingerprint::of_data(&i.to_le_bytes()).matches_sampling_mask(4) {
                hits += 1;
            }
        }
        assert!((800..1250).contains(&hits), "got {hits} anchors");
    }

    #[test]
    fn serde_round_trip() {
        let fp = Fingerprint::of_data(b"abc");
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
    }
}
