//! Write cache of open containers.
//!
//! A bounded ring of slots, each holding one open container protected by a
//! read-write lock. The selection strategy decides which slot a new item
//! lands in; `earliest-free` concentrates writes in low slots under light
//! load, which yields fewer, denser containers.

use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use bds_api_types::WriteCacheStrategy;

use crate::container::Container;

pub struct WriteCacheSlot {
    pub container: RwLock<Option<Container>>,
    last_access: Mutex<Instant>,
}

impl WriteCacheSlot {
    fn new() -> Self {
        Self {
            container: RwLock::new(None),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_access.lock().unwrap().elapsed().as_secs()
    }
}

pub struct WriteCache {
    slots: Vec<WriteCacheSlot>,
    strategy: WriteCacheStrategy,
    round_robin: Mutex<usize>,
}

impl WriteCache {
    pub fn new(size: usize, strategy: WriteCacheStrategy) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| WriteCacheSlot::new()).collect(),
            strategy,
            round_robin: Mutex::new(0),
        }
    }

    pub fn slots(&self) -> &[WriteCacheSlot] {
        &self.slots
    }

    fn next_round_robin(&self) -> usize {
        let mut counter = self.round_robin.lock().unwrap();
        let slot = *counter % self.slots.len();
        *counter = counter.wrapping_add(1);
        slot
    }

    /// Select a slot for a new item and return it write-locked.
    pub fn select(
        &self,
    ) -> (usize, RwLockWriteGuard<'_, Option<Container>>) {
        match self.strategy {
            WriteCacheStrategy::EarliestFree => {
                // prefer the lowest uncontended slot
                for (index, slot) in self.slots.iter().enumerate() {
                    if let Ok(guard) = slot.container.try_write() {
                        slot.touch();
                        return (index, guard);
                    }
                }
                let index = self.next_round_robin();
                self.slots[index].touch();
                (index, self.slots[index].container.write().unwrap())
            }
            WriteCacheStrategy::RoundRobin => {
                let index = self.next_round_robin();
                self.slots[index].touch();
                (index, self.slots[index].container.write().unwrap())
            }
        }
    }

    /// Find the open container holding `container_id`, read-locked.
    pub fn find(
        &self,
        container_id: u64,
    ) -> Option<RwLockReadGuard<'_, Option<Container>>> {
        for slot in &self.slots {
            let guard = slot.container.read().unwrap();
            if guard.as_ref().map(Container::id) == Some(container_id) {
                return Some(guard);
            }
        }
        None
    }

    pub fn contains(&self, container_id: u64) -> bool {
        self.find(container_id).is_some()
    }

    /// Open container ids, for commit state queries.
    pub fn open_ids(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter_map(|slot| slot.container.read().unwrap().as_ref().map(Container::id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_free_prefers_low_slots() {
        let cache = WriteCache::new(4, WriteCacheStrategy::EarliestFree);
        let (index, mut guard) = cache.select();
        assert_eq!(index, 0);
        *guard = Some(Container::new(1, 4096));
        drop(guard);

        // slot 0 is free again, so it wins again
        let (index, _guard) = cache.select();
        assert_eq!(index, 0);
    }

    #[test]
    fn earliest_free_skips_contended_slots() {
        let cache = WriteCache::new(4, WriteCacheStrategy::EarliestFree);
        let _held = cache.slots()[0].container.write().unwrap();
        let (index, _guard) = cache.select();
        assert_eq!(index, 1);
    }

    #[test]
    fn round_robin_cycles() {
        let cache = WriteCache::new(3, WriteCacheStrategy::RoundRobin);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (index, _guard) = cache.select();
            seen.push(index);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn find_open_container() {
        let cache = WriteCache::new(2, WriteCacheStrategy::EarliestFree);
        {
            let (_, mut guard) = cache.select();
            *guard = Some(Container::new(42, 4096));
        }
        assert!(cache.contains(42));
        assert!(!cache.contains(43));
        assert_eq!(cache.open_ids(), vec![42]);
    }
}
