//! Persistent store for component checkpoints and statistics.
//!
//! Keys are human-readable strings, values arbitrary JSON documents. Every
//! subsystem persists its counters here on stop and restores them on start.

use std::sync::Arc;

use anyhow::{format_err, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use bds_index::Index;

pub struct InfoStore {
    index: Arc<dyn Index>,
}

impl InfoStore {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self { index }
    }

    pub fn persist<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(value)?;
        self.index
            .put(key.as_bytes(), &payload)
            .map_err(|err| format_err!("persisting info record '{key}' failed - {err}"))
    }

    pub fn restore<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let payload = self
            .index
            .lookup(key.as_bytes())
            .map_err(|err| format_err!("restoring info record '{key}' failed - {err}"))?;
        match payload {
            None => Ok(None),
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), Error> {
        self.index
            .delete(key.as_bytes())
            .map_err(|err| format_err!("deleting info record '{key}' failed - {err}"))?;
        Ok(())
    }

    /// All records, for inspection tooling.
    pub fn dump(&self) -> Result<Vec<(String, Value)>, Error> {
        let mut iter = self.index.iterate()?;
        let mut out = Vec::new();
        while let Some((key, payload)) = iter.next_entry()? {
            let key = String::from_utf8_lossy(&key).into_owned();
            out.push((key, serde_json::from_slice(&payload)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.index.sync()?;
        Ok(())
    }
}
