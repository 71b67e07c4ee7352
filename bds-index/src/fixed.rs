//! Fixed record array back-end.
//!
//! Values live in sector-aligned slots addressed by a small integer id;
//! one file per shard. Keys are 8-byte big-endian ids so the lexicographic
//! cursor order equals the numeric id order. A reserved state byte marks
//! deleted slots without reclaiming them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::uio::{pread, pwrite};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
    VersionStamp,
};

const FIXED_INDEX_MAGIC: [u8; 8] = *b"BDSFIXD1";
const HEADER_SIZE: usize = 512;
const SECTOR_SIZE: usize = 512;

const SLOT_FREE: u8 = 0;
const SLOT_USED: u8 = 1;
const SLOT_DELETED: u8 = 2;

// state byte + value length
const SLOT_HEADER_SIZE: usize = 1 + 4;
const SLOT_TRAILER_SIZE: usize = 4; // crc32 over state, length and value

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

fn id_from_key(key: &[u8]) -> Result<u64, IndexError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| IndexError::IllegalKey(format!("expected 8-byte id, got {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

pub struct FixedIndex {
    state: Mutex<State>,
    version: VersionStamp,
    record_size: usize,
    slot_size: usize,
    shard_count: usize,
}

struct State {
    files: Vec<File>,
    item_count: u64,
    highest_id: Option<u64>,
}

impl FixedIndex {
    /// Open or create the shard files under `base`.
    pub fn open<P: AsRef<Path>>(
        base: P,
        shard_count: usize,
        record_size: usize,
    ) -> Result<Self, IndexError> {
        let base = base.as_ref();
        std::fs::create_dir_all(base)?;
        let shard_count = shard_count.max(1);
        let slot_size = align_up(SLOT_HEADER_SIZE + record_size + SLOT_TRAILER_SIZE, SECTOR_SIZE);

        let mut files = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let path = Self::shard_path(base, shard);
            let file = Self::open_shard(&path, shard, record_size)?;
            files.push(file);
        }

        let index = Self {
            state: Mutex::new(State {
                files,
                item_count: 0,
                highest_id: None,
            }),
            version: VersionStamp::default(),
            record_size,
            slot_size,
            shard_count,
        };
        index.rescan()?;
        Ok(index)
    }

    fn shard_path(base: &Path, shard: usize) -> PathBuf {
        base.join(format!("records-{shard:04}.fixd"))
    }

    fn open_shard(path: &Path, shard: usize, record_size: usize) -> Result<File, IndexError> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut header = [0u8; HEADER_SIZE];
        if exists {
            let got = pread(file.as_raw_fd(), &mut header, 0).map_err(std::io::Error::from)?;
            if got != HEADER_SIZE {
                return Err(IndexError::corruption(format!(
                    "short header in {path:?} ({got} bytes)"
                )));
            }
            if header[0..8] != FIXED_INDEX_MAGIC {
                return Err(IndexError::corruption(format!("bad magic in {path:?}")));
            }
            let stored_record_size =
                u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
            if stored_record_size != record_size {
                return Err(IndexError::corruption(format!(
                    "record size mismatch in {path:?} ({stored_record_size} != {record_size})"
                )));
            }
        } else {
            header[0..8].copy_from_slice(&FIXED_INDEX_MAGIC);
            header[8..12].copy_from_slice(&(shard as u32).to_le_bytes());
            header[12..16].copy_from_slice(&(record_size as u32).to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
        }
        Ok(file)
    }

    fn slot_location(&self, id: u64) -> (usize, u64) {
        let shard = (id % self.shard_count as u64) as usize;
        let slot = id / self.shard_count as u64;
        let offset = HEADER_SIZE as u64 + slot * self.slot_size as u64;
        (shard, offset)
    }

    fn slot_crc(state_byte: u8, value: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[state_byte]);
        hasher.update(&(value.len() as u32).to_le_bytes());
        hasher.update(value);
        hasher.finalize()
    }

    /// Read a slot; Ok(None) when free, deleted or beyond EOF.
    fn read_slot(&self, state: &State, id: u64) -> Result<Option<Vec<u8>>, IndexError> {
        let (shard, offset) = self.slot_location(id);
        let file = &state.files[shard];
        let mut buf = vec![0u8; self.slot_size];
        let got = pread(file.as_raw_fd(), &mut buf, offset as i64).map_err(std::io::Error::from)?;
        if got == 0 {
            return Ok(None); // beyond EOF, never written
        }
        if got < SLOT_HEADER_SIZE {
            return Err(IndexError::corruption(format!("torn slot for id {id}")));
        }
        match buf[0] {
            SLOT_FREE | SLOT_DELETED => Ok(None),
            SLOT_USED => {
                let value_size = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
                if value_size > self.record_size {
                    return Err(IndexError::corruption(format!(
                        "slot for id {id} claims {value_size} bytes"
                    )));
                }
                let value = buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + value_size].to_vec();
                let crc_offset = SLOT_HEADER_SIZE + value_size;
                let stored_crc =
                    u32::from_le_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
                if stored_crc != Self::slot_crc(SLOT_USED, &value) {
                    return Err(IndexError::corruption(format!("crc mismatch for id {id}")));
                }
                Ok(Some(value))
            }
            other => Err(IndexError::corruption(format!(
                "unknown slot state {other} for id {id}"
            ))),
        }
    }

    fn write_slot(&self, state: &State, id: u64, value: &[u8]) -> Result<(), IndexError> {
        if value.len() > self.record_size {
            return Err(IndexError::IllegalKey(format!(
                "value of {} bytes exceeds record size {}",
                value.len(),
                self.record_size
            )));
        }
        let (shard, offset) = self.slot_location(id);
        let file = &state.files[shard];

        let mut buf = vec![0u8; self.slot_size];
        buf[0] = SLOT_USED;
        buf[1..5].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + value.len()].copy_from_slice(value);
        let crc = Self::slot_crc(SLOT_USED, value);
        buf[SLOT_HEADER_SIZE + value.len()..SLOT_HEADER_SIZE + value.len() + 4]
            .copy_from_slice(&crc.to_le_bytes());

        pwrite(file.as_raw_fd(), &buf, offset as i64).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn mark_deleted(&self, state: &State, id: u64) -> Result<(), IndexError> {
        let (shard, offset) = self.slot_location(id);
        let file = &state.files[shard];
        pwrite(file.as_raw_fd(), &[SLOT_DELETED], offset as i64).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn rescan(&self) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0u64;
        let mut highest = None;
        for shard in 0..self.shard_count {
            let len = state.files[shard].metadata()?.len();
            if len <= HEADER_SIZE as u64 {
                continue;
            }
            let slots = (len - HEADER_SIZE as u64) / self.slot_size as u64;
            for slot in 0..slots {
                let id = slot * self.shard_count as u64 + shard as u64;
                if self.read_slot(&state, id)?.is_some() {
                    count += 1;
                    highest = Some(highest.map_or(id, |h: u64| h.max(id)));
                }
            }
        }
        state.item_count = count;
        state.highest_id = highest;
        Ok(())
    }

    fn note_put(state: &mut State, id: u64, was_present: bool) {
        if !was_present {
            state.item_count += 1;
        }
        state.highest_id = Some(state.highest_id.map_or(id, |h| h.max(id)));
    }
}

impl Index for FixedIndex {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: true,
            iterate: true,
            cursor: true,
            compare_and_swap: true,
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        let id = id_from_key(key)?;
        let state = self.state.lock().unwrap();
        self.read_slot(&state, id)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        let id = id_from_key(key)?;
        let mut state = self.state.lock().unwrap();
        let was_present = self.read_slot(&state, id)?.is_some();
        self.write_slot(&state, id, value)?;
        Self::note_put(&mut state, id, was_present);
        self.version.bump();
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        let id = id_from_key(key)?;
        let mut state = self.state.lock().unwrap();
        if self.read_slot(&state, id)?.is_some() {
            return Ok(PutIfAbsentResult::AlreadyPresent);
        }
        self.write_slot(&state, id, value)?;
        Self::note_put(&mut state, id, false);
        self.version.bump();
        Ok(PutIfAbsentResult::Inserted)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let id = id_from_key(key)?;
        let mut state = self.state.lock().unwrap();
        let current = self.read_slot(&state, id)?;
        if current.as_deref() != expected {
            return Ok(CasResult::Stale(current));
        }
        let was_present = current.is_some();
        self.write_slot(&state, id, new)?;
        Self::note_put(&mut state, id, was_present);
        self.version.bump();
        Ok(CasResult::Swapped)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let id = id_from_key(key)?;
        let mut state = self.state.lock().unwrap();
        if self.read_slot(&state, id)?.is_none() {
            return Ok(DeleteResult::NotFound);
        }
        self.mark_deleted(&state, id)?;
        state.item_count -= 1;
        self.version.bump();
        Ok(DeleteResult::Ok)
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        let highest = self.state.lock().unwrap().highest_id;
        Ok(Box::new(FixedIter {
            index: FixedIterHandle {
                version: self.version.clone(),
                seen: self.version.current(),
            },
            entries: self.collect_range(0, highest)?,
            at: 0,
        }))
    }

    fn scan_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        let start_id = if start.is_empty() {
            0
        } else if start.len() < 8 {
            let mut padded = [0u8; 8];
            padded[..start.len()].copy_from_slice(start);
            u64::from_be_bytes(padded)
        } else {
            id_from_key(&start[..8])?
        };
        let state = self.state.lock().unwrap();
        let highest = match state.highest_id {
            Some(highest) => highest,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        let mut id = start_id;
        while id <= highest && out.len() < limit {
            if let Some(value) = self.read_slot(&state, id)? {
                out.push((id_key(id).to_vec(), value));
            }
            id += 1;
        }
        Ok(out)
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        Ok(self.state.lock().unwrap().item_count)
    }

    fn sync(&self) -> Result<(), IndexError> {
        let state = self.state.lock().unwrap();
        for file in &state.files {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl FixedIndex {
    fn collect_range(
        &self,
        from: u64,
        highest: Option<u64>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        if let Some(highest) = highest {
            for id in from..=highest {
                if let Some(value) = self.read_slot(&state, id)? {
                    out.push((id_key(id).to_vec(), value));
                }
            }
        }
        Ok(out)
    }
}

struct FixedIterHandle {
    version: VersionStamp,
    seen: u64,
}

struct FixedIter {
    index: FixedIterHandle,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
}

impl IndexIterator for FixedIter {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        self.index.version.check(self.index.seen)?;
        if self.at >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.at].clone();
        self.at += 1;
        Ok(Some(entry))
    }
}
