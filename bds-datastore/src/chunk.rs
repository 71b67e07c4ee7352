//! Chunks as produced by a chunker session.

use bds_api_types::MAX_CHUNK_SIZE;

use crate::fingerprint::Fingerprint;

/// An owned chunk of request data, alive until the filter chain has
/// observed it.
pub struct Chunk {
    data: Vec<u8>,
    fingerprint: Option<Fingerprint>,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        debug_assert!(!data.is_empty());
        debug_assert!(data.len() <= MAX_CHUNK_SIZE);
        Self {
            data,
            fingerprint: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&byte| byte == 0)
    }

    /// The fingerprint, computing and caching it on first use. All-zero
    /// content gets the reserved empty-chunk fingerprint.
    pub fn fingerprint(&mut self) -> Fingerprint {
        if let Some(fp) = self.fingerprint {
            return fp;
        }
        let fp = if self.is_all_zero() {
            Fingerprint::empty_chunk()
        } else {
            Fingerprint::of_data(&self.data)
        };
        self.fingerprint = Some(fp);
        fp
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_chunk_gets_reserved_fingerprint() {
        let mut chunk = Chunk::new(vec![0u8; 4096]);
        assert!(chunk.fingerprint().is_empty_chunk());

        let mut chunk = Chunk::new(vec![1u8; 4096]);
        assert!(!chunk.fingerprint().is_empty_chunk());
    }

    #[test]
    fn fingerprint_is_cached() {
        let mut chunk = Chunk::new(b"some data".to_vec());
        let first = chunk.fingerprint();
        assert_eq!(first, chunk.fingerprint());
        assert_eq!(first, Fingerprint::of_data(b"some data"));
    }
}
