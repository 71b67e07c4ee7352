//! Per-consumer container processing state.
//!
//! Log consumers that act once per committed container (chunk index import,
//! block index ready checks) track which container ids they have handled, so
//! replays stay idempotent across restarts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ILLEGAL_DATA_ADDRESS, LEAST_VALID_CONTAINER_ID};

#[derive(Clone, Debug)]
pub struct ContainerTracker {
    least_non_processed_id: u64,
    highest_seen_id: u64,
    processed: BTreeSet<u64>,
    in_flight: BTreeSet<u64>,
}

/// Serialized checkpoint form.
#[derive(Serialize, Deserialize)]
pub struct ContainerTrackerData {
    pub least_non_processed_id: u64,
    pub highest_seen_id: u64,
    pub processed: Vec<u64>,
}

impl Default for ContainerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerTracker {
    pub fn new() -> Self {
        Self {
            least_non_processed_id: LEAST_VALID_CONTAINER_ID,
            highest_seen_id: ILLEGAL_DATA_ADDRESS,
            processed: BTreeSet::new(),
            in_flight: BTreeSet::new(),
        }
    }

    pub fn clear(&mut self) {
        self.least_non_processed_id = LEAST_VALID_CONTAINER_ID;
        self.highest_seen_id = ILLEGAL_DATA_ADDRESS;
        self.processed.clear();
        self.in_flight.clear();
    }

    fn should_process_test(&self, id: u64) -> bool {
        if id < self.least_non_processed_id {
            false
        } else if id == self.least_non_processed_id {
            true
        } else {
            !self.processed.contains(&id)
        }
    }

    /// Check whether `id` still needs processing, noting it as seen.
    pub fn should_process(&mut self, id: u64) -> bool {
        let result = self.should_process_test(id);
        if self.highest_seen_id == ILLEGAL_DATA_ADDRESS || id > self.highest_seen_id {
            self.highest_seen_id = id;
        }
        result
    }

    pub fn processing(&mut self, id: u64) {
        self.in_flight.insert(id);
    }

    pub fn abort_processing(&mut self, id: u64) {
        self.in_flight.remove(&id);
    }

    pub fn processed(&mut self, id: u64) {
        self.in_flight.remove(&id);
        if id == self.least_non_processed_id {
            // advance to the next unprocessed id, dropping the prefix
            let mut next = self.least_non_processed_id + 1;
            while self.processed.contains(&next) {
                next += 1;
            }
            self.least_non_processed_id = next;
            self.processed = self.processed.split_off(&next);
        } else {
            self.processed.insert(id);
        }
    }

    /// Forget the processed set, advancing the least id past everything
    /// processed so far.
    ///
    /// When the tracker is empty but has seen higher ids, the least id is
    /// deliberately NOT advanced past `highest_seen + 1`; this mirrors the
    /// long-standing reset behavior consumers checkpoint against.
    pub fn reset(&mut self) {
        if !self.processed.is_empty() {
            let max = self
                .processed
                .iter()
                .next_back()
                .copied()
                .unwrap()
                .max(self.least_non_processed_id);
            if self.highest_seen_id != ILLEGAL_DATA_ADDRESS
                && self.least_non_processed_id <= self.highest_seen_id
            {
                self.least_non_processed_id = max + 1;
            }
        }
        self.processed.clear();
    }

    pub fn least_non_processed_id(&self) -> u64 {
        self.least_non_processed_id
    }

    pub fn highest_seen_id(&self) -> Option<u64> {
        if self.highest_seen_id == ILLEGAL_DATA_ADDRESS {
            None
        } else {
            Some(self.highest_seen_id)
        }
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn to_data(&self) -> ContainerTrackerData {
        ContainerTrackerData {
            least_non_processed_id: self.least_non_processed_id,
            highest_seen_id: self.highest_seen_id,
            processed: self.processed.iter().copied().collect(),
        }
    }

    pub fn from_data(data: &ContainerTrackerData) -> Self {
        Self {
            least_non_processed_id: data.least_non_processed_id,
            highest_seen_id: data.highest_seen_id,
            processed: data.processed.iter().copied().collect(),
            in_flight: BTreeSet::new(),
        }
    }
}
