//! Striped chunk locks.
//!
//! A fixed array of locks selected by fingerprint hash serializes chunk
//! index updates and GC usage count changes for the same fingerprint. No
//! execution path may hold two chunk locks at once; this is enforced at
//! runtime through a thread-local marker, and lock-requiring operations
//! take a [`ChunkLockGuard`] as proof instead of re-acquiring.

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::sync::{Condvar, Mutex};

use crate::fingerprint::Fingerprint;

thread_local! {
    static HELD_LOCK: Cell<Option<usize>> = const { Cell::new(None) };
}

pub struct ChunkLocks {
    state: Mutex<Vec<bool>>,
    cond: Condvar,
    count: usize,
}

pub struct ChunkLockGuard<'a> {
    locks: &'a ChunkLocks,
    index: usize,
    fingerprint: Fingerprint,
}

impl ChunkLocks {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            state: Mutex::new(vec![false; count]),
            cond: Condvar::new(),
            count,
        }
    }

    fn index_of(&self, fingerprint: &Fingerprint) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fingerprint.as_bytes().hash(&mut hasher);
        (hasher.finish() % self.count as u64) as usize
    }

    fn assert_none_held() {
        HELD_LOCK.with(|held| {
            assert!(
                held.get().is_none(),
                "attempt to take a second chunk lock on this thread"
            );
        });
    }

    /// Block until the fingerprint's lock is available.
    pub fn lock(&self, fingerprint: &Fingerprint) -> ChunkLockGuard<'_> {
        Self::assert_none_held();
        let index = self.index_of(fingerprint);
        let mut state = self.state.lock().unwrap();
        while state[index] {
            state = self.cond.wait(state).unwrap();
        }
        state[index] = true;
        drop(state);
        HELD_LOCK.with(|held| held.set(Some(index)));
        ChunkLockGuard {
            locks: self,
            index,
            fingerprint: *fingerprint,
        }
    }

    /// Non-blocking variant, used by the GC candidate sweep.
    pub fn try_lock(&self, fingerprint: &Fingerprint) -> Option<ChunkLockGuard<'_>> {
        Self::assert_none_held();
        let index = self.index_of(fingerprint);
        let mut state = self.state.lock().unwrap();
        if state[index] {
            return None;
        }
        state[index] = true;
        drop(state);
        HELD_LOCK.with(|held| held.set(Some(index)));
        Some(ChunkLockGuard {
            locks: self,
            index,
            fingerprint: *fingerprint,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl ChunkLockGuard<'_> {
    /// The fingerprint this guard was taken for. Operations that require
    /// the lock assert the guard covers their fingerprint.
    pub fn covers(&self, fingerprint: &Fingerprint) -> bool {
        self.locks.index_of(fingerprint) == self.index
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for ChunkLockGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.locks.state.lock().unwrap();
        state[self.index] = false;
        drop(state);
        HELD_LOCK.with(|held| held.set(None));
        self.locks.cond.notify_all();
    }
}
