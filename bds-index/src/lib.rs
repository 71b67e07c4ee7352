//! Uniform key-value index abstraction.
//!
//! Every persistent subsystem of the engine stores its state through this
//! contract, so back-ends stay interchangeable: a volatile hash for caches
//! and tests, sector-aligned record files for id-keyed data, a bucketed
//! on-disk hash, and embedded LSM/B+ tree stores for large key spaces.
//!
//! Iteration is versioned: an iterator created before a mutation fails with
//! [`IndexError::ConcurrentModification`] instead of yielding a torn view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod btree;
pub mod disk_hash;
pub mod fixed;
pub mod lsm;
pub mod mem;
pub mod write_back;

pub use write_back::WriteBackIndex;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index corruption: {0}")]
    Corruption(String),
    #[error("index was modified while an iterator was open")]
    ConcurrentModification,
    #[error("operation not supported by this back-end")]
    Unsupported,
    #[error("illegal key: {0}")]
    IllegalKey(String),
    #[error("back-end error: {0}")]
    Backend(String),
}

impl IndexError {
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        IndexError::Corruption(msg.into())
    }

    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        IndexError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutIfAbsentResult {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Swapped,
    /// The stored value did not match; carries the current value as witness.
    Stale(Option<Vec<u8>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Ok,
    NotFound,
}

/// What a back-end can do; callers check this instead of probing for
/// [`IndexError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub persistent: bool,
    pub iterate: bool,
    /// Ordered traversal via [`Index::scan_from`].
    pub cursor: bool,
    pub compare_and_swap: bool,
}

/// Unordered, versioned traversal handle.
pub trait IndexIterator: Send {
    /// Next entry, or None at the end. Fails with `ConcurrentModification`
    /// if the index changed since the iterator was created.
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError>;
}

pub trait Index: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexError>;

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutIfAbsentResult, IndexError>;

    /// Atomically replace the value iff the stored value equals `expected`
    /// (`None` = key must be absent).
    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<CasResult, IndexError>;

    fn delete(&self, key: &[u8]) -> Result<DeleteResult, IndexError>;

    fn iterate(&self) -> Result<Box<dyn IndexIterator>, IndexError>;

    /// Ordered batch scan starting at `start` (inclusive), at most `limit`
    /// entries. Only back-ends with the `cursor` capability implement this.
    fn scan_from(
        &self,
        _start: &[u8],
        _limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        Err(IndexError::Unsupported)
    }

    /// All-or-nothing batch put, as far as the back-end can guarantee it.
    fn put_batch(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<(), IndexError> {
        for (key, value) in batch {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn item_count(&self) -> Result<u64, IndexError>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Ordered cursor over a back-end with the `cursor` capability, built on
/// repeated [`Index::scan_from`] batches.
pub struct Cursor<'a> {
    index: &'a dyn Index,
    buffer: std::collections::VecDeque<(Vec<u8>, Vec<u8>)>,
    next_start: Option<Vec<u8>>,
    batch_size: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(index: &'a dyn Index) -> Self {
        Self::starting_at(index, &[])
    }

    pub fn starting_at(index: &'a dyn Index, start: &[u8]) -> Self {
        Self {
            index,
            buffer: std::collections::VecDeque::new(),
            next_start: Some(start.to_vec()),
            batch_size: 256,
        }
    }

    fn refill(&mut self) -> Result<(), IndexError> {
        let start = match self.next_start.take() {
            Some(start) => start,
            None => return Ok(()),
        };
        let batch = self.index.scan_from(&start, self.batch_size)?;
        if batch.len() == self.batch_size {
            // resume strictly after the last key of this batch
            let mut next = batch.last().unwrap().0.clone();
            next.push(0);
            self.next_start = Some(next);
        }
        self.buffer.extend(batch);
        Ok(())
    }

    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        if self.buffer.is_empty() {
            self.refill()?;
        }
        Ok(self.buffer.pop_front())
    }
}

/// Shared mutation counter used by back-ends to invalidate open iterators.
#[derive(Clone, Default)]
pub(crate) struct VersionStamp {
    version: Arc<AtomicU64>,
}

impl VersionStamp {
    pub fn bump(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn current(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn check(&self, seen: u64) -> Result<(), IndexError> {
        if self.current() != seen {
            return Err(IndexError::ConcurrentModification);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Exercise the generic contract every back-end has to satisfy.
    pub fn check_index_contract(index: &dyn Index) {
        assert_eq!(index.lookup(b"missing").unwrap(), None);

        index.put(b"alpha", b"1").unwrap();
        assert_eq!(index.lookup(b"alpha").unwrap(), Some(b"1".to_vec()));

        assert_eq!(
            index.put_if_absent(b"alpha", b"2").unwrap(),
            PutIfAbsentResult::AlreadyPresent
        );
        assert_eq!(
            index.put_if_absent(b"beta", b"2").unwrap(),
            PutIfAbsentResult::Inserted
        );

        match index.compare_and_swap(b"alpha", Some(b"0"), b"3").unwrap() {
            CasResult::Stale(witness) => assert_eq!(witness, Some(b"1".to_vec())),
            other => panic!("unexpected CAS result: {other:?}"),
        }
        assert_eq!(
            index.compare_and_swap(b"alpha", Some(b"1"), b"3").unwrap(),
            CasResult::Swapped
        );
        assert_eq!(index.lookup(b"alpha").unwrap(), Some(b"3".to_vec()));

        assert_eq!(index.delete(b"beta").unwrap(), DeleteResult::Ok);
        assert_eq!(index.delete(b"beta").unwrap(), DeleteResult::NotFound);

        index
            .put_batch(&[
                (b"k1".to_vec(), b"v1".to_vec()),
                (b"k2".to_vec(), b"v2".to_vec()),
            ])
            .unwrap();
        assert_eq!(index.item_count().unwrap(), 3);

        let mut seen = 0;
        let mut iter = index.iterate().unwrap();
        while let Some((_key, _value)) = iter.next_entry().unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 3);

        // mutating invalidates open iterators
        let mut iter = index.iterate().unwrap();
        index.put(b"gamma", b"4").unwrap();
        let mut failed = false;
        loop {
            match iter.next_entry() {
                Err(IndexError::ConcurrentModification) => {
                    failed = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(failed, "iterator survived a concurrent mutation");
    }
}
