//! Striped block locks.
//!
//! Write requests for the same block id are serialized by a fixed lock
//! array striped by block id. A request spanning two adjacent blocks takes
//! both locks in ascending id order; ids striping to the same slot share a
//! single lock acquisition.

use std::sync::{Mutex, MutexGuard};

pub struct BlockLocks {
    locks: Vec<Mutex<()>>,
}

pub struct BlockLockGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
    block_ids: Vec<u64>,
}

impl BlockLocks {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            locks: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, block_id: u64) -> usize {
        (block_id % self.locks.len() as u64) as usize
    }

    pub fn lock(&self, block_id: u64) -> BlockLockGuard<'_> {
        let guard = self.locks[self.stripe(block_id)].lock().unwrap();
        BlockLockGuard {
            _guards: vec![guard],
            block_ids: vec![block_id],
        }
    }

    /// Lock two adjacent blocks; ids must be given in ascending order.
    pub fn lock_pair(&self, first: u64, second: u64) -> BlockLockGuard<'_> {
        assert!(first < second, "block locks must be taken in ascending order");
        let first_stripe = self.stripe(first);
        let second_stripe = self.stripe(second);

        let mut guards = Vec::with_capacity(2);
        if first_stripe == second_stripe {
            guards.push(self.locks[first_stripe].lock().unwrap());
        } else {
            // ascending id order, not stripe order, keeps the documented
            // protocol observable; stripe collisions are handled above
            guards.push(self.locks[first_stripe].lock().unwrap());
            guards.push(self.locks[second_stripe].lock().unwrap());
        }
        BlockLockGuard {
            _guards: guards,
            block_ids: vec![first, second],
        }
    }

    pub fn count(&self) -> usize {
        self.locks.len()
    }
}

impl BlockLockGuard<'_> {
    pub fn covers(&self, block_id: u64) -> bool {
        self.block_ids.contains(&block_id)
    }
}
