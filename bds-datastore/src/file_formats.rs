use endian_trait::Endian;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// openssl::sha::sha256(b"Blockdedup chunk container v1.0")[0..8]
pub const CONTAINER_MAGIC_1_0: [u8; 8] = [88, 12, 197, 230, 121, 14, 73, 205];

// openssl::sha::sha256(b"Blockdedup operation log segment v1.0")[0..8]
pub const LOG_SEGMENT_MAGIC_1_0: [u8; 8] = [41, 190, 17, 102, 9, 228, 54, 131];

// openssl::sha::sha256(b"Blockdedup operation log header v1.0")[0..8]
pub const LOG_HEADER_MAGIC_1_0: [u8; 8] = [150, 62, 201, 11, 94, 37, 178, 66];

/// Container flag bits.
pub const CONTAINER_FLAG_COMMITTED: u32 = 1 << 0;
pub const CONTAINER_FLAG_CHECKSUM: u32 = 1 << 1;

/// Per-item flag bits.
pub const ITEM_FLAG_ZSTD: u8 = 1 << 0;
pub const ITEM_FLAG_DEFLATE: u8 = 1 << 1;
pub const ITEM_FLAG_DELETED: u8 = 1 << 2;
pub const ITEM_FLAG_INDEXED: u8 = 1 << 3;

/// Container binary storage format
///
/// A container is a fixed-size packed unit, written with a single aligned
/// write. The fixed header is followed by `item_count` item headers and the
/// item bodies; the last four bytes of the container hold a CRC32 over all
/// preceding bytes.
///
/// (MAGIC || ID || FLAGS || ITEM_COUNT || BODY_SIZE || ITEMS || ... || CRC32)
#[derive(Endian)]
#[repr(C, packed)]
pub struct ContainerHeader {
    pub magic: [u8; 8],
    pub container_id: u64,
    pub flags: u32,
    pub item_count: u32,
    pub body_byte_size: u64,
}
proxmox_lang::static_assert_size!(ContainerHeader, 32);

pub const CONTAINER_HEADER_SIZE: usize = std::mem::size_of::<ContainerHeader>();

/// Size of one encoded item header:
/// fp_size (2) || fp (32) || flags (1) || offset (4) || size (4)
pub const CONTAINER_ITEM_HEADER_SIZE: usize = 2 + 32 + 1 + 4 + 4;

/// Log record framing:
/// log_id (8) || type (2) || payload_size (4) || payload || crc (4),
/// padded to an 8 byte boundary.
pub const LOG_RECORD_HEADER_SIZE: usize = 8 + 2 + 4;
pub const LOG_RECORD_ALIGNMENT: usize = 8;

/// Log header sector, stored at offset 0 of segment file 0.
#[derive(Endian)]
#[repr(C, packed)]
pub struct LogHeader {
    pub magic: [u8; 8],
    pub next_log_id: u64,
    pub oldest_live_log_id: u64,
    pub crc: u32,
    pub reserved: [u8; 484], // overall size is one sector (512 bytes)
}
proxmox_lang::static_assert_size!(LogHeader, 512);

pub const LOG_HEADER_SIZE: usize = std::mem::size_of::<LogHeader>();
