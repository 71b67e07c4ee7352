//! Bucketed on-disk hash back-end.
//!
//! Keys are hashed over a set of bucket files (count auto-tuned from the
//! configured capacity). Each bucket file is a sequence of CRC-framed
//! records; the newest record for a key wins, a tombstone record marks a
//! delete. The key directory is rebuilt by a scan on open, a torn record at
//! a file tail is discarded by truncation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::uio::{pread, pwrite};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
    VersionStamp,
};

const RECORD_HEADER_SIZE: usize = 2 + 1 + 4; // key_len, flags, value_len
const RECORD_TRAILER_SIZE: usize = 4; // crc32

const FLAG_TOMBSTONE: u8 = 1;

#[derive(Clone, Copy)]
struct Location {
    bucket: usize,
    value_offset: u64,
    value_len: u32,
}

struct State {
    files: Vec<File>,
    tails: Vec<u64>,
    directory: HashMap<Vec<u8>, Location>,
}

pub struct DiskHashIndex {
    state: Mutex<State>,
    version: VersionStamp,
    bucket_count: usize,
}

fn bucket_of(key: &[u8], bucket_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % bucket_count as u64) as usize
}

fn record_crc(key: &[u8], flags: u8, value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(key.len() as u16).to_le_bytes());
    hasher.update(&[flags]);
    hasher.update(&(value.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

impl DiskHashIndex {
    /// Auto-tune the bucket count from the expected capacity.
    pub fn bucket_count_for_capacity(capacity: u64) -> usize {
        ((capacity / (128 * 1024)).next_power_of_two() as usize).clamp(1, 64)
    }

    pub fn open<P: AsRef<Path>>(base: P, capacity: u64) -> Result<Self, IndexError> {
        let base = base.as_ref();
        std::fs::create_dir_all(base)?;
        let bucket_count = Self::bucket_count_for_capacity(capacity);

        let mut files = Vec::with_capacity(bucket_count);
        for bucket in 0..bucket_count {
            let path = Self::bucket_path(base, bucket);
            let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            files.push(file);
        }

        let mut state = State {
            files,
            tails: vec![0; bucket_count],
            directory: HashMap::new(),
        };
        for bucket in 0..bucket_count {
            Self::scan_bucket(&mut state, bucket)?;
        }

        Ok(Self {
            state: Mutex::new(state),
            version: VersionStamp::default(),
            bucket_count,
        })
    }

    fn bucket_path(base: &Path, bucket: usize) -> PathBuf {
        base.join(format!("bucket-{bucket:03}.dhsh"))
    }

    fn scan_bucket(state: &mut State, bucket: usize) -> Result<(), IndexError> {
        let len = state.files[bucket].metadata()?.len();
        let fd = state.files[bucket].as_raw_fd();
        let mut offset = 0u64;

        while offset < len {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            let got = pread(fd, &mut header, offset as i64).map_err(std::io::Error::from)?;
            if got < RECORD_HEADER_SIZE {
                break; // torn tail
            }
            let key_len = u16::from_le_bytes(header[0..2].try_into().unwrap()) as usize;
            let flags = header[2];
            let value_len = u32::from_le_bytes(header[3..7].try_into().unwrap()) as usize;
            let record_len = RECORD_HEADER_SIZE + key_len + value_len + RECORD_TRAILER_SIZE;
            if offset + record_len as u64 > len {
                break; // torn tail
            }

            let mut body = vec![0u8; key_len + value_len + RECORD_TRAILER_SIZE];
            let got = pread(fd, &mut body, (offset as usize + RECORD_HEADER_SIZE) as i64)
                .map_err(std::io::Error::from)?;
            if got < body.len() {
                break;
            }
            let key = &body[..key_len];
            let value = &body[key_len..key_len + value_len];
            let stored_crc = u32::from_le_bytes(
                body[key_len + value_len..key_len + value_len + 4].try_into().unwrap(),
            );
            if stored_crc != record_crc(key, flags, value) {
                break; // torn tail, everything after is void
            }

            if flags & FLAG_TOMBSTONE != 0 {
                state.directory.remove(key);
            } else {
                state.directory.insert(
                    key.to_vec(),
                    Location {
                        bucket,
                        value_offset: offset + (RECORD_HEADER_SIZE + key_len) as u64,
                        value_len: value_len as u32,
                    },
                );
            }
            offset += record_len as u64;
        }

        if offset < len {
            log::warn!(
                "discarding {} torn bytes at the tail of hash bucket {}",
                len - offset,
                bucket
            );
            nix::unistd::ftruncate(fd, offset as i64).map_err(std::io::Error::from)?;
        }
        state.tails[bucket] = offset;
        Ok(())
    }

    fn append_record(
        state: &mut State,
        bucket: usize,
        key: &[u8],
        flags: u8,
        value: &[u8],
    ) -> Result<u64, IndexError> {
        let mut record =
            Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len() + RECORD_TRAILER_SIZE);
        record.extend_from_slice(&(key.len() as u16).to_le_bytes());
        record.push(flags);
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        record.extend_from_slice(&record_crc(key, flags, value).to_le_bytes());

        let offset = state.tails[bucket];
        let fd = state.files[bucket].as_raw_fd();
        pwrite(fd, &record, offset as i64).map_err(std::io::Error::from)?;
        state.tails[bucket] = offset + record.len() as u64;
        Ok(offset)
    }

    fn read_value(state: &State, location: Location) -> Result<Vec<u8>, IndexError> {
        let mut value = vec![0u8; location.value_len as usize];
        let got = pread(
            state.files[location.bucket].as_raw_fd(),
            &mut value,
            location.value_offset as i64,
        )
        .map_err(std::io::Error::from)?;
        if got != value.len() {
            return Err(IndexError::corruption("short value read"));
        }
        Ok(value)
    }

    fn put_locked(&self, state: &mut State, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        let bucket = bucket_of(key, self.bucket_count);
        let offset = Self::append_record(state, bucket, key, 0, value)?;
        state.directory.insert(
            key.to_vec(),
            Location {
                bucket,
                value_offset: offset + (RECORD_HEADER_SIZE + key.len()) as u64,
                value_len: value.len() as u32,
            },
        );
        self.version.bump();
        Ok(())
    }
}

impl Index for DiskHashIndex {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: true,
            iterate: true,
            cursor: false,
            compare_and_swap: true,
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        let state = self.state.lock().unwrap();
        match state.directory.get(key) {
            Some(&location) => Ok(Some(Self::read_value(&state, location)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        self.put_locked(&mut state, key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        let mut state = self.state.lock().unwrap();
        if state.directory.contains_key(key) {
            return Ok(PutIfAbsentResult::AlreadyPresent);
        }
        self.put_locked(&mut state, key, value)?;
        Ok(PutIfAbsentResult::Inserted)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let mut state = self.state.lock().unwrap();
        let current = match state.directory.get(key) {
            Some(&location) => Some(Self::read_value(&state, location)?),
            None => None,
        };
        if current.as_deref() != expected {
            return Ok(CasResult::Stale(current));
        }
        self.put_locked(&mut state, key, new)?;
        Ok(CasResult::Swapped)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let mut state = self.state.lock().unwrap();
        if !state.directory.contains_key(key) {
            return Ok(DeleteResult::NotFound);
        }
        let bucket = bucket_of(key, self.bucket_count);
        Self::append_record(&mut state, bucket, key, FLAG_TOMBSTONE, &[])?;
        state.directory.remove(key);
        self.version.bump();
        Ok(DeleteResult::Ok)
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        let state = self.state.lock().unwrap();
        let mut entries = Vec::with_capacity(state.directory.len());
        for (key, &location) in state.directory.iter() {
            entries.push((key.clone(), Self::read_value(&state, location)?));
        }
        Ok(Box::new(DiskHashIter {
            entries,
            at: 0,
            version: self.version.clone(),
            seen: self.version.current(),
        }))
    }

    fn put_batch(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        for (key, value) in batch {
            self.put_locked(&mut state, key, value)?;
        }
        Ok(())
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        Ok(self.state.lock().unwrap().directory.len() as u64)
    }

    fn sync(&self) -> Result<(), IndexError> {
        let state = self.state.lock().unwrap();
        for file in &state.files {
            file.sync_data()?;
        }
        Ok(())
    }
}

struct DiskHashIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
    version: VersionStamp,
    seen: u64,
}

impl IndexIterator for DiskHashIter {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        self.version.check(self.seen)?;
        if self.at >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.at].clone();
        self.at += 1;
        Ok(Some(entry))
    }
}
