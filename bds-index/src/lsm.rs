//! Embedded LSM-tree back-end (`fjall`).

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
    VersionStamp,
};

pub struct LsmIndex {
    keyspace: Keyspace,
    partition: PartitionHandle,
    version: VersionStamp,
    // serializes read-modify-write operations (CAS, put_if_absent)
    write_lock: std::sync::Mutex<()>,
}

impl LsmIndex {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, IndexError> {
        let keyspace = Config::new(base.as_ref())
            .open()
            .map_err(IndexError::backend)?;
        let partition = keyspace
            .open_partition("index", PartitionCreateOptions::default())
            .map_err(IndexError::backend)?;
        Ok(Self {
            keyspace,
            partition,
            version: VersionStamp::default(),
            write_lock: std::sync::Mutex::new(()),
        })
    }
}

impl Index for LsmIndex {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: true,
            iterate: true,
            cursor: true,
            compare_and_swap: true,
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self
            .partition
            .get(key)
            .map_err(IndexError::backend)?
            .map(|slice| slice.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        self.partition.insert(key, value).map_err(IndexError::backend)?;
        self.version.bump();
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        let _guard = self.write_lock.lock().unwrap();
        if self.partition.get(key).map_err(IndexError::backend)?.is_some() {
            return Ok(PutIfAbsentResult::AlreadyPresent);
        }
        self.partition.insert(key, value).map_err(IndexError::backend)?;
        self.version.bump();
        Ok(PutIfAbsentResult::Inserted)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let _guard = self.write_lock.lock().unwrap();
        let current = self
            .partition
            .get(key)
            .map_err(IndexError::backend)?
            .map(|slice| slice.to_vec());
        if current.as_deref() != expected {
            return Ok(CasResult::Stale(current));
        }
        self.partition.insert(key, new).map_err(IndexError::backend)?;
        self.version.bump();
        Ok(CasResult::Swapped)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let _guard = self.write_lock.lock().unwrap();
        if self.partition.get(key).map_err(IndexError::backend)?.is_none() {
            return Ok(DeleteResult::NotFound);
        }
        self.partition.remove(key).map_err(IndexError::backend)?;
        self.version.bump();
        Ok(DeleteResult::Ok)
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        let iter = self.partition.iter();
        Ok(Box::new(LsmIter {
            inner: Box::new(iter),
            version: self.version.clone(),
            seen: self.version.current(),
        }))
    }

    fn scan_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        let mut out = Vec::new();
        for entry in self.partition.range(start.to_vec()..).take(limit) {
            let (key, value) = entry.map_err(IndexError::backend)?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn put_batch(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<(), IndexError> {
        let mut write_batch = self.keyspace.batch();
        for (key, value) in batch {
            write_batch.insert(&self.partition, key.clone(), value.clone());
        }
        write_batch.commit().map_err(IndexError::backend)?;
        self.version.bump();
        Ok(())
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        Ok(self.partition.len().map_err(IndexError::backend)? as u64)
    }

    fn sync(&self) -> Result<(), IndexError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(IndexError::backend)
    }
}

type LsmInner = Box<dyn Iterator<Item = Result<(fjall::Slice, fjall::Slice), fjall::Error>> + Send>;

struct LsmIter {
    inner: LsmInner,
    version: VersionStamp,
    seen: u64,
}

impl IndexIterator for LsmIter {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        self.version.check(self.seen)?;
        match self.inner.next() {
            None => Ok(None),
            Some(Err(err)) => Err(IndexError::backend(err)),
            Some(Ok((key, value))) => Ok(Some((key.to_vec(), value.to_vec()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-lsm-contract-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let index = LsmIndex::open(&dir).unwrap();
        crate::testutil::check_index_contract(&index);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cursor_walks_in_order() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-lsm-cursor-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let index = LsmIndex::open(&dir).unwrap();
        for id in 0u32..600 {
            index.put(&id.to_be_bytes(), &id.to_le_bytes()).unwrap();
        }
        // more entries than one scan batch, so the cursor has to refill
        let mut cursor = crate::Cursor::new(&index);
        let mut seen = 0u32;
        while let Some((key, _value)) = cursor.next_entry().unwrap() {
            assert_eq!(key, seen.to_be_bytes());
            seen += 1;
        }
        assert_eq!(seen, 600);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ordered_scan() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-lsm-scan-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let index = LsmIndex::open(&dir).unwrap();
        for key in ["delta", "alpha", "charlie", "bravo"] {
            index.put(key.as_bytes(), b"x").unwrap();
        }
        let entries = index.scan_from(b"b", 10).unwrap();
        let keys: Vec<&str> = entries
            .iter()
            .map(|(key, _)| std::str::from_utf8(key).unwrap())
            .collect();
        assert_eq!(keys, vec!["bravo", "charlie", "delta"]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
