//! Volatile in-memory hash back-end, used for auxiliary maps and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
    VersionStamp,
};

#[derive(Default)]
pub struct MemIndex {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    version: VersionStamp,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.map.lock().unwrap()
    }
}

impl Index for MemIndex {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: false,
            iterate: true,
            cursor: false,
            compare_and_swap: true,
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self.locked().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        self.locked().insert(key.to_vec(), value.to_vec());
        self.version.bump();
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        let mut map = self.locked();
        if map.contains_key(key) {
            return Ok(PutIfAbsentResult::AlreadyPresent);
        }
        map.insert(key.to_vec(), value.to_vec());
        self.version.bump();
        Ok(PutIfAbsentResult::Inserted)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let mut map = self.locked();
        let current = map.get(key).cloned();
        if current.as_deref() != expected {
            return Ok(CasResult::Stale(current));
        }
        map.insert(key.to_vec(), new.to_vec());
        self.version.bump();
        Ok(CasResult::Swapped)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let removed = self.locked().remove(key).is_some();
        if removed {
            self.version.bump();
            Ok(DeleteResult::Ok)
        } else {
            Ok(DeleteResult::NotFound)
        }
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .locked()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Box::new(MemIter {
            entries,
            at: 0,
            version: self.version.clone(),
            seen: self.version.current(),
        }))
    }

    fn put_batch(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<(), IndexError> {
        let mut map = self.locked();
        for (key, value) in batch {
            map.insert(key.clone(), value.clone());
        }
        self.version.bump();
        Ok(())
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        Ok(self.locked().len() as u64)
    }
}

struct MemIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
    version: VersionStamp,
    seen: u64,
}

impl IndexIterator for MemIter {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract() {
        let index = MemIndex::new();
        crate::testutil::check_index_contract(&index);
    }
}
