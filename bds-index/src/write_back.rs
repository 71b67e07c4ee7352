//! Write-back cache wrapper around a persistent index.
//!
//! Dirty items live in memory until a background committer migrates them to
//! the backing index. Pinned items are excluded from migration until
//! unpinned; component-specific ordering constraints are expressed through
//! pinning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted,
    Pinned,
    NotDirty,
}

struct DirtyItem {
    value: Vec<u8>,
    pinned: bool,
}

pub struct WriteBackIndex {
    backing: Arc<dyn Index>,
    dirty: Mutex<HashMap<Vec<u8>, DirtyItem>>,
}

impl WriteBackIndex {
    pub fn new(backing: Arc<dyn Index>) -> Self {
        Self {
            backing,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    pub fn backing(&self) -> &Arc<dyn Index> {
        &self.backing
    }

    /// Lookup consulting the dirty set before the backing index.
    pub fn lookup_dirty(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        if let Some(item) = self.dirty.lock().unwrap().get(key) {
            return Ok(Some(item.value.clone()));
        }
        self.backing.lookup(key)
    }

    /// Stage a value in the dirty set without touching the backing index.
    pub fn put_dirty(&self, key: &[u8], value: &[u8], pin: bool) {
        self.dirty.lock().unwrap().insert(
            key.to_vec(),
            DirtyItem {
                value: value.to_vec(),
                pinned: pin,
            },
        );
    }

    /// Force a dirty item to the backing index, pinned or not.
    pub fn ensure_persistent(&self, key: &[u8]) -> Result<bool, IndexError> {
        let item = self.dirty.lock().unwrap().remove(key);
        match item {
            Some(item) => {
                self.backing.put(key, &item.value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist one dirty item if it is unpinned.
    pub fn try_persist_dirty_item(&self, key: &[u8]) -> Result<PersistOutcome, IndexError> {
        let value = {
            let mut dirty = self.dirty.lock().unwrap();
            match dirty.get(key) {
                None => return Ok(PersistOutcome::NotDirty),
                Some(item) if item.pinned => return Ok(PersistOutcome::Pinned),
                Some(_) => dirty.remove(key).unwrap().value,
            }
        };
        self.backing.put(key, &value)?;
        Ok(PersistOutcome::Persisted)
    }

    /// Discard every pinned item without persisting it.
    pub fn drop_all_pinned(&self) -> usize {
        let mut dirty = self.dirty.lock().unwrap();
        let before = dirty.len();
        dirty.retain(|_, item| !item.pinned);
        before - dirty.len()
    }

    /// Returns false when the key is not dirty.
    pub fn change_pinning_state(&self, key: &[u8], pinned: bool) -> bool {
        match self.dirty.lock().unwrap().get_mut(key) {
            Some(item) => {
                item.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Persist all unpinned dirty items; returns how many were written.
    pub fn persist_all_dirty(&self) -> Result<usize, IndexError> {
        let batch: Vec<(Vec<u8>, Vec<u8>)> = {
            let mut dirty = self.dirty.lock().unwrap();
            let keys: Vec<Vec<u8>> = dirty
                .iter()
                .filter(|(_, item)| !item.pinned)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .map(|key| {
                    let value = dirty.remove(&key).unwrap().value;
                    (key, value)
                })
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        self.backing.put_batch(&batch)?;
        Ok(batch.len())
    }

    /// Unpinned dirty keys, for background migration sweeps.
    pub fn dirty_keys(&self) -> Vec<Vec<u8>> {
        self.dirty
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, item)| !item.pinned)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn dirty_item_count(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    /// Distinct keys across the dirty set and the backing index.
    pub fn total_item_count(&self) -> Result<u64, IndexError> {
        let mut count = self.backing.item_count()?;
        for key in self.dirty.lock().unwrap().keys() {
            if self.backing.lookup(key)?.is_none() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// The plain [`Index`] view is write-through: `put` and `delete` bypass the
/// dirty set (and retire any stale dirty entry for the key).
impl Index for WriteBackIndex {
    fn capabilities(&self) -> Capabilities {
        let mut caps = self.backing.capabilities();
        caps.iterate = false; // the dirty set would make iteration torn
        caps.cursor = false;
        caps
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        self.lookup_dirty(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        self.dirty.lock().unwrap().remove(key);
        self.backing.put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        if self.dirty.lock().unwrap().contains_key(key) {
            return Ok(PutIfAbsentResult::AlreadyPresent);
        }
        self.backing.put_if_absent(key, value)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let mut dirty = self.dirty.lock().unwrap();
        if let Some(item) = dirty.get_mut(key) {
            if Some(item.value.as_slice()) != expected {
                return Ok(CasResult::Stale(Some(item.value.clone())));
            }
            item.value = new.to_vec();
            return Ok(CasResult::Swapped);
        }
        drop(dirty);
        self.backing.compare_and_swap(key, expected, new)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let was_dirty = self.dirty.lock().unwrap().remove(key).is_some();
        match self.backing.delete(key)? {
            DeleteResult::Ok => Ok(DeleteResult::Ok),
            DeleteResult::NotFound if was_dirty => Ok(DeleteResult::Ok),
            DeleteResult::NotFound => Ok(DeleteResult::NotFound),
        }
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        Err(IndexError::Unsupported)
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        self.total_item_count()
    }

    fn sync(&self) -> Result<(), IndexError> {
        self.backing.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemIndex;

    fn wrapped() -> WriteBackIndex {
        WriteBackIndex::new(Arc::new(MemIndex::new()))
    }

    #[test]
    fn dirty_lookup_precedes_backing() {
        let index = wrapped();
        index.backing().put(b"key", b"old").unwrap();
        index.put_dirty(b"key", b"new", false);
        assert_eq!(index.lookup_dirty(b"key").unwrap(), Some(b"new".to_vec()));
        assert_eq!(index.backing().lookup(b"key").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn pinned_items_stay() {
        let index = wrapped();
        index.put_dirty(b"pinned", b"1", true);
        index.put_dirty(b"loose", b"2", false);

        assert_eq!(
            index.try_persist_dirty_item(b"pinned").unwrap(),
            PersistOutcome::Pinned
        );
        assert_eq!(index.persist_all_dirty().unwrap(), 1);
        assert_eq!(index.dirty_item_count(), 1);
        assert_eq!(index.backing().lookup(b"loose").unwrap(), Some(b"2".to_vec()));
        assert_eq!(index.backing().lookup(b"pinned").unwrap(), None);

        assert!(index.change_pinning_state(b"pinned", false));
        assert_eq!(
            index.try_persist_dirty_item(b"pinned").unwrap(),
            PersistOutcome::Persisted
        );
        assert_eq!(index.backing().lookup(b"pinned").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn ensure_persistent_overrides_pin() {
        let index = wrapped();
        index.put_dirty(b"key", b"value", true);
        assert!(index.ensure_persistent(b"key").unwrap());
        assert_eq!(index.dirty_item_count(), 0);
        assert_eq!(index.backing().lookup(b"key").unwrap(), Some(b"value".to_vec()));
        assert!(!index.ensure_persistent(b"key").unwrap());
    }

    #[test]
    fn drop_all_pinned_discards() {
        let index = wrapped();
        index.put_dirty(b"one", b"1", true);
        index.put_dirty(b"two", b"2", false);
        assert_eq!(index.drop_all_pinned(), 1);
        assert_eq!(index.dirty_item_count(), 1);
        assert_eq!(index.lookup_dirty(b"one").unwrap(), None);
    }

    #[test]
    fn total_count_deduplicates() {
        let index = wrapped();
        index.backing().put(b"both", b"a").unwrap();
        index.put_dirty(b"both", b"b", false);
        index.put_dirty(b"only-dirty", b"c", false);
        assert_eq!(index.total_item_count().unwrap(), 2);
    }
}
