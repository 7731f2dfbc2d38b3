//! Applied State Record
//!
//! Last successfully applied body of every managed object, plus a generation
//! counter. The controller owns the store exclusively; the diff engine reads
//! a snapshot of it and the reconciler writes it only after an operation
//! succeeded.

mod file;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DesiredConfig, ObjectBody, ObjectKey};

pub use file::FileStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub body: ObjectBody,
    pub generation: u64,
}

/// Read-only view of the applied record handed to the diff engine
pub type AppliedState = BTreeMap<ObjectKey, AppliedRecord>;

pub trait StateStore: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<AppliedRecord>;

    /// Record a successful apply. `generation` must be larger than the
    /// generation currently stored for `key`.
    fn put(&mut self, key: ObjectKey, body: ObjectBody, generation: u64) -> Result<()>;

    fn delete(&mut self, key: &ObjectKey) -> Result<()>;

    fn snapshot(&self) -> AppliedState;

    /// Generation to use for the next write; never handed out twice
    fn next_generation(&self) -> u64;

    /// Discard every record and repopulate from `objects` (rebuild mode)
    fn replace_all(&mut self, objects: DesiredConfig) -> Result<()>;

    /// Load persisted records. Durable stores return
    /// [`Error::StoreCorruption`] and start empty when the data is damaged.
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    /// Persist pending writes
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether records survive a restart
    fn is_durable(&self) -> bool {
        false
    }
}

/// Record set shared by the store implementations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Records {
    high_water: u64,
    entries: Vec<(ObjectKey, AppliedRecord)>,
    #[serde(skip)]
    index: BTreeMap<ObjectKey, AppliedRecord>,
}

impl Records {
    fn get(&self, key: &ObjectKey) -> Option<AppliedRecord> {
        self.index.get(key).cloned()
    }

    fn put(&mut self, key: ObjectKey, body: ObjectBody, generation: u64) -> Result<()> {
        if !body.matches_kind(key.kind) {
            return Err(Error::StoreError(format!(
                "body does not match kind of {key}"
            )));
        }
        if let Some(existing) = self.index.get(&key) {
            if generation <= existing.generation {
                return Err(Error::StoreError(format!(
                    "generation {generation} for {key} is not newer than {}",
                    existing.generation
                )));
            }
        }
        self.high_water = self.high_water.max(generation);
        self.index.insert(key, AppliedRecord { body, generation });
        Ok(())
    }

    fn delete(&mut self, key: &ObjectKey) {
        self.index.remove(key);
    }

    fn next_generation(&self) -> u64 {
        self.high_water.saturating_add(1)
    }

    fn replace_all(&mut self, objects: DesiredConfig) {
        self.index.clear();
        for (key, body) in objects {
            self.high_water = self.high_water.saturating_add(1);
            let generation = self.high_water;
            self.index.insert(key, AppliedRecord { body, generation });
        }
    }

    /// Move the index into the serializable list form
    fn to_persisted(&self) -> Self {
        Self {
            high_water: self.high_water,
            entries: self
                .index
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            index: BTreeMap::new(),
        }
    }

    fn from_persisted(mut persisted: Self) -> Result<Self> {
        let mut index = BTreeMap::new();
        for (key, record) in persisted.entries.drain(..) {
            if !record.body.matches_kind(key.kind) {
                return Err(Error::StoreCorruption(format!(
                    "record {key} holds a body of the wrong kind"
                )));
            }
            if record.generation > persisted.high_water {
                return Err(Error::StoreCorruption(format!(
                    "record {key} has generation {} above high water mark {}",
                    record.generation, persisted.high_water
                )));
            }
            index.insert(key, record);
        }
        Ok(Self {
            high_water: persisted.high_water,
            entries: Vec::new(),
            index,
        })
    }
}

/// Non-durable store; rebuilt from the traffic manager at startup
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Records,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &ObjectKey) -> Option<AppliedRecord> {
        self.records.get(key)
    }

    fn put(&mut self, key: ObjectKey, body: ObjectBody, generation: u64) -> Result<()> {
        self.records.put(key, body, generation)
    }

    fn delete(&mut self, key: &ObjectKey) -> Result<()> {
        self.records.delete(key);
        Ok(())
    }

    fn snapshot(&self) -> AppliedState {
        self.records.index.clone()
    }

    fn next_generation(&self) -> u64 {
        self.records.next_generation()
    }

    fn replace_all(&mut self, objects: DesiredConfig) -> Result<()> {
        self.records.replace_all(objects);
        Ok(())
    }
}
