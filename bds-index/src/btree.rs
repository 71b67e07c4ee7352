//! Embedded B+ tree back-end (`redb`).

use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::{
    Capabilities, CasResult, DeleteResult, Index, IndexError, IndexIterator, PutIfAbsentResult,
    VersionStamp,
};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index");

pub struct BtreeIndex {
    db: Database,
    version: VersionStamp,
}

impl BtreeIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path.as_ref()).map_err(IndexError::backend)?;
        // make sure the table exists so read transactions never fail
        let txn = db.begin_write().map_err(IndexError::backend)?;
        txn.open_table(TABLE).map_err(IndexError::backend)?;
        txn.commit().map_err(IndexError::backend)?;
        Ok(Self {
            db,
            version: VersionStamp::default(),
        })
    }

    fn read_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        let txn = self.db.begin_read().map_err(IndexError::backend)?;
        let table = txn.open_table(TABLE).map_err(IndexError::backend)?;
        Ok(table
            .get(key)
            .map_err(IndexError::backend)?
            .map(|guard| guard.value().to_vec()))
    }
}

impl Index for BtreeIndex {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: true,
            iterate: true,
            cursor: true,
            compare_and_swap: true,
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        self.read_value(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        let txn = self.db.begin_write().map_err(IndexError::backend)?;
        {
            let mut table = txn.open_table(TABLE).map_err(IndexError::backend)?;
            table.insert(key, value).map_err(IndexError::backend)?;
        }
        txn.commit().map_err(IndexError::backend)?;
        self.version.bump();
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError> {
        let txn = self.db.begin_write().map_err(IndexError::backend)?;
        let inserted = {
            let mut table = txn.open_table(TABLE).map_err(IndexError::backend)?;
            let present = table.get(key).map_err(IndexError::backend)?.is_some();
            if !present {
                table.insert(key, value).map_err(IndexError::backend)?;
            }
            !present
        };
        txn.commit().map_err(IndexError::backend)?;
        if inserted {
            self.version.bump();
            Ok(PutIfAbsentResult::Inserted)
        } else {
            Ok(PutIfAbsentResult::AlreadyPresent)
        }
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError> {
        let txn = self.db.begin_write().map_err(IndexError::backend)?;
        let result = {
            let mut table = txn.open_table(TABLE).map_err(IndexError::backend)?;
            let current = table
                .get(key)
                .map_err(IndexError::backend)?
                .map(|guard| guard.value().to_vec());
            if current.as_deref() != expected {
                CasResult::Stale(current)
            } else {
                table.insert(key, new).map_err(IndexError::backend)?;
                CasResult::Swapped
            }
        };
        txn.commit().map_err(IndexError::backend)?;
        if result == CasResult::Swapped {
            self.version.bump();
        }
        Ok(result)
    }

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError> {
        let txn = self.db.begin_write().map_err(IndexError::backend)?;
        let removed = {
            let mut table = txn.open_table(TABLE).map_err(IndexError::backend)?;
            table.remove(key).map_err(IndexError::backend)?.is_some()
        };
        txn.commit().map_err(IndexError::backend)?;
        if removed {
            self.version.bump();
            Ok(DeleteResult::Ok)
        } else {
            Ok(DeleteResult::NotFound)
        }
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError> {
        // snapshot through a read transaction, then serve from the copy;
        // open iterators are still invalidated by later mutations
        let entries = self.scan_from(&[], usize::MAX)?;
        Ok(Box::new(BtreeIter {
            entries,
            at: 0,
            version: self.version.clone(),
            seen: self.version.current(),
        }))
    }

    fn scan_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        let txn = self.db.begin_read().map_err(IndexError::backend)?;
        let table = txn.open_table(TABLE).map_err(IndexError::backend)?;
        let mut out = Vec::new();
        for entry in table.range(start..).map_err(IndexError::backend)?.take(limit) {
            let (key, value) = entry.map_err(IndexError::backend)?;
            out.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn put_batch(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<(), IndexError> {
        let txn = self.db.begin_write().map_err(IndexError::backend)?;
        {
            let mut table = txn.open_table(TABLE).map_err(IndexError::backend)?;
            for (key, value) in batch {
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(IndexError::backend)?;
            }
        }
        txn.commit().map_err(IndexError::backend)?;
        self.version.bump();
        Ok(())
    }

    fn item_count(&self) -> Result<u64, IndexError> {
        let txn = self.db.begin_read().map_err(IndexError::backend)?;
        let table = txn.open_table(TABLE).map_err(IndexError::backend)?;
        table.len().map_err(IndexError::backend)
    }
}

struct BtreeIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
    version: VersionStamp,
    seen: u64,
}

impl IndexIterator for BtreeIter {
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
        let mut path = std::env::temp_dir();
        path.push(format!("bds-btree-contract-{}.redb", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let index = BtreeIndex::open(&path).unwrap();
        crate::testutil::check_index_contract(&index);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn survives_reopen() {
        let mut path = std::env::temp_dir();
        path.push(format!("bds-btree-reopen-{}.redb", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let index = BtreeIndex::open(&path).unwrap();
            index.put(b"alpha", b"1").unwrap();
        }
        let index = BtreeIndex::open(&path).unwrap();
        assert_eq!(index.lookup(b"alpha").unwrap(), Some(b"1".to_vec()));
        let _ = std::fs::remove_file(&path);
    }
}
