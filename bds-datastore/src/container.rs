//! Packed chunk containers.
//!
//! A container collects variable-size chunks until it is full, then gets
//! committed with a single aligned write. Items are located by fingerprint;
//! payloads are compressed individually when that actually shrinks them.

use std::io::Write;

use anyhow::format_err;

use bds_api_types::CompressionType;

use crate::error::{DedupError, Result};
use crate::file_formats::{
    CONTAINER_FLAG_CHECKSUM, CONTAINER_FLAG_COMMITTED, CONTAINER_HEADER_SIZE,
    CONTAINER_ITEM_HEADER_SIZE, CONTAINER_MAGIC_1_0, ITEM_FLAG_DEFLATE, ITEM_FLAG_ZSTD,
};
use crate::fingerprint::{Fingerprint, FINGERPRINT_SIZE};

#[derive(Clone)]
pub struct ContainerItem {
    pub fingerprint: Fingerprint,
    pub flags: u8,
    /// Raw (uncompressed) chunk bytes.
    pub data: Vec<u8>,
}

/// An in-memory container, open for appends or decoded from disk.
pub struct Container {
    id: u64,
    container_size: usize,
    items: Vec<ContainerItem>,
    /// Raw payload bytes of all items.
    body_size: usize,
}

impl Container {
    pub fn new(id: u64, container_size: usize) -> Self {
        Self {
            id,
            container_size,
            items: Vec::new(),
            body_size: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ContainerItem] {
        &self.items
    }

    pub fn container_size(&self) -> usize {
        self.container_size
    }

    /// Raw payload bytes currently held.
    pub fn body_size(&self) -> usize {
        self.body_size
    }

    fn encoded_size(&self, extra_items: usize, extra_bytes: usize) -> usize {
        CONTAINER_HEADER_SIZE
            + (self.items.len() + extra_items) * CONTAINER_ITEM_HEADER_SIZE
            + self.body_size
            + extra_bytes
            + 4
    }

    /// Whether one more item of `data_len` raw bytes still fits. Sizing is
    /// conservative: compression can only shrink the encoding.
    pub fn can_fit(&self, data_len: usize) -> bool {
        self.encoded_size(1, data_len) <= self.container_size
    }

    pub fn add_item(&mut self, fingerprint: Fingerprint, data: Vec<u8>) -> Result<()> {
        self.add_item_with_flags(fingerprint, data, 0)
    }

    pub fn add_item_with_flags(
        &mut self,
        fingerprint: Fingerprint,
        data: Vec<u8>,
        flags: u8,
    ) -> Result<()> {
        if !self.can_fit(data.len()) {
            return Err(DedupError::programming(format!(
                "item of {} bytes does not fit container {}",
                data.len(),
                self.id
            )));
        }
        self.body_size += data.len();
        self.items.push(ContainerItem {
            fingerprint,
            flags,
            data,
        });
        Ok(())
    }

    pub fn find_item(&self, fingerprint: &Fingerprint) -> Option<&ContainerItem> {
        self.items.iter().find(|item| item.fingerprint == *fingerprint)
    }

    fn compress_item(data: &[u8], compression: CompressionType) -> (u8, Vec<u8>) {
        match compression {
            CompressionType::None => (0, data.to_vec()),
            CompressionType::Zstd => match zstd::bulk::compress(data, 1) {
                Ok(compressed) if compressed.len() < data.len() => (ITEM_FLAG_ZSTD, compressed),
                _ => (0, data.to_vec()),
            },
            CompressionType::Deflate => {
                let mut encoder =
                    flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
                let compressed = encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .unwrap_or_default();
                if !compressed.is_empty() && compressed.len() < data.len() {
                    (ITEM_FLAG_DEFLATE, compressed)
                } else {
                    (0, data.to_vec())
                }
            }
        }
    }

    fn decompress_item(flags: u8, data: &[u8]) -> Result<Vec<u8>> {
        if flags & ITEM_FLAG_ZSTD != 0 {
            zstd::bulk::decompress(data, bds_api_types::MAX_CHUNK_SIZE)
                .map_err(|err| DedupError::integrity(format_err!("zstd decompress: {err}")))
        } else if flags & ITEM_FLAG_DEFLATE != 0 {
            let mut decoder = flate2::write::DeflateDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .and_then(|_| decoder.finish())
                .map_err(|err| DedupError::integrity(format_err!("deflate decompress: {err}")))
        } else {
            Ok(data.to_vec())
        }
    }

    /// Encode into a zero-padded buffer of exactly `container_size` bytes,
    /// trailing CRC32 over everything before it.
    pub fn encode(&self, compression: CompressionType) -> Result<Vec<u8>> {
        let mut encoded: Vec<(u8, Vec<u8>)> = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let (flags, data) = Self::compress_item(&item.data, compression);
            encoded.push((item.flags | flags, data));
        }

        let headers_end = CONTAINER_HEADER_SIZE + self.items.len() * CONTAINER_ITEM_HEADER_SIZE;
        let body_bytes: usize = encoded.iter().map(|(_, data)| data.len()).sum();
        if headers_end + body_bytes + 4 > self.container_size {
            return Err(DedupError::programming(format!(
                "container {} overflows its size on encode",
                self.id
            )));
        }

        let mut buf = vec![0u8; self.container_size];
        buf[0..8].copy_from_slice(&CONTAINER_MAGIC_1_0);
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        let flags = CONTAINER_FLAG_COMMITTED | CONTAINER_FLAG_CHECKSUM;
        buf[16..20].copy_from_slice(&flags.to_le_bytes());
        buf[20..24].copy_from_slice(&(self.items.len() as u32).to_le_bytes());
        buf[24..32].copy_from_slice(&(body_bytes as u64).to_le_bytes());

        let mut header_at = CONTAINER_HEADER_SIZE;
        let mut body_at = 0usize;
        for (item, (flags, data)) in self.items.iter().zip(encoded.iter()) {
            buf[header_at..header_at + 2]
                .copy_from_slice(&(FINGERPRINT_SIZE as u16).to_le_bytes());
            buf[header_at + 2..header_at + 34].copy_from_slice(item.fingerprint.as_bytes());
            buf[header_at + 34] = *flags;
            buf[header_at + 35..header_at + 39].copy_from_slice(&(body_at as u32).to_le_bytes());
            buf[header_at + 39..header_at + 43]
                .copy_from_slice(&(data.len() as u32).to_le_bytes());
            header_at += CONTAINER_ITEM_HEADER_SIZE;

            buf[headers_end + body_at..headers_end + body_at + data.len()].copy_from_slice(data);
            body_at += data.len();
        }

        let crc_at = self.container_size - 4;
        let crc = crc32fast::hash(&buf[..crc_at]);
        buf[crc_at..].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode a container buffer, verifying magic, CRC and item bounds.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTAINER_HEADER_SIZE + 4 {
            return Err(DedupError::integrity("container buffer too small"));
        }
        if buf[0..8] != CONTAINER_MAGIC_1_0 {
            return Err(DedupError::integrity("bad container magic"));
        }

        let crc_at = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[crc_at..].try_into().unwrap());
        if stored_crc != crc32fast::hash(&buf[..crc_at]) {
            return Err(DedupError::integrity("container crc mismatch"));
        }

        let id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if flags & CONTAINER_FLAG_COMMITTED == 0 {
            return Err(DedupError::integrity(format!(
                "container {id} was never committed"
            )));
        }
        let item_count = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        let body_bytes = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;

        let headers_end = CONTAINER_HEADER_SIZE + item_count * CONTAINER_ITEM_HEADER_SIZE;
        if headers_end + body_bytes + 4 > buf.len() {
            return Err(DedupError::integrity(format!(
                "container {id} header exceeds container size"
            )));
        }

        let mut items = Vec::with_capacity(item_count);
        let mut raw_size = 0usize;
        let mut expected_offset = 0usize;
        for index in 0..item_count {
            let at = CONTAINER_HEADER_SIZE + index * CONTAINER_ITEM_HEADER_SIZE;
            let fp_size = u16::from_le_bytes(buf[at..at + 2].try_into().unwrap()) as usize;
            if fp_size != FINGERPRINT_SIZE {
                return Err(DedupError::integrity(format!(
                    "container {id} item {index} has fingerprint size {fp_size}"
                )));
            }
            let fingerprint = Fingerprint::from_slice(&buf[at + 2..at + 34])
                .map_err(DedupError::Other)?;
            let item_flags = buf[at + 34];
            let offset = u32::from_le_bytes(buf[at + 35..at + 39].try_into().unwrap()) as usize;
            let size = u32::from_le_bytes(buf[at + 39..at + 43].try_into().unwrap()) as usize;

            // encode lays items out back to back; overlaps are corruption
            if offset != expected_offset || offset + size > body_bytes {
                return Err(DedupError::integrity(format!(
                    "container {id} item {index} has overlapping or out of range payload"
                )));
            }
            expected_offset = offset + size;

            let payload = &buf[headers_end + offset..headers_end + offset + size];
            let data = Self::decompress_item(item_flags, payload)?;
            raw_size += data.len();
            items.push(ContainerItem {
                fingerprint,
                flags: item_flags & !(ITEM_FLAG_ZSTD | ITEM_FLAG_DEFLATE),
                data,
            });
        }

        Ok(Self {
            id,
            container_size: buf.len(),
            items,
            body_size: raw_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_container() -> Container {
        let mut container = Container::new(7, 64 * 1024);
        for i in 0u8..5 {
            let data = vec![i; 1000 + i as usize * 17];
            container
                .add_item(Fingerprint::of_data(&data), data)
                .unwrap();
        }
        container
    }

    #[test]
    fn encode_decode_round_trip() {
        for compression in [
            CompressionType::None,
            CompressionType::Zstd,
            CompressionType::Deflate,
        ] {
            let container = filled_container();
            let buf = container.encode(compression).unwrap();
            assert_eq!(buf.len(), 64 * 1024);

            let decoded = Container::decode(&buf).unwrap();
            assert_eq!(decoded.id(), 7);
            assert_eq!(decoded.item_count(), 5);
            for (orig, copy) in container.items().iter().zip(decoded.items()) {
                assert_eq!(orig.fingerprint, copy.fingerprint);
                assert_eq!(orig.data, copy.data);
            }
        }
    }

    #[test]
    fn truncation_is_rejected() {
        let container = filled_container();
        let mut buf = container.encode(CompressionType::None).unwrap();
        // flipping the last payload byte must break the CRC
        let len = buf.len();
        buf[len - 5] ^= 0xff;
        assert!(matches!(
            Container::decode(&buf),
            Err(DedupError::Integrity(_))
        ));
    }

    #[test]
    fn capacity_accounting() {
        let mut container = Container::new(1, 4096);
        assert!(container.can_fit(1024));
        container
            .add_item(Fingerprint::of_data(b"a"), vec![1u8; 1024])
            .unwrap();
        container
            .add_item(Fingerprint::of_data(b"b"), vec![2u8; 1024])
            .unwrap();
        // header + 3 item headers + 2048 + next item may not exceed 4096
        assert!(!container.can_fit(2048));
        assert!(container.add_item(Fingerprint::of_data(b"c"), vec![3u8; 2048]).is_err());
    }

    #[test]
    fn find_item_by_fingerprint() {
        let container = filled_container();
        let wanted = container.items()[2].fingerprint;
        let item = container.find_item(&wanted).unwrap();
        assert_eq!(item.data, container.items()[2].data);
        assert!(container.find_item(&Fingerprint::of_data(b"nope")).is_none());
    }
}
