//! File-backed applied state
//!
//! The file holds a JSON envelope with the serialized records as a string and
//! a SHA-256 checksum over that string. Writes go to a sibling temp file which
//! is then renamed over the original.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{AppliedRecord, AppliedState, Records, StateStore};
use crate::error::{Error, Result};
use crate::model::{DesiredConfig, ObjectBody, ObjectKey};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    payload: String,
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Records,
    dirty: bool,
}

impl FileStore {
    /// Create a store backed by `path`; nothing is read until [`StateStore::load`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Records::default(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(&self) -> Result<Option<Records>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::IoError(e)),
        };

        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|e| Error::StoreCorruption(format!("unreadable state file: {e}")))?;
        if envelope.version != FORMAT_VERSION {
            return Err(Error::StoreCorruption(format!(
                "unsupported state file version {}",
                envelope.version
            )));
        }
        if checksum(&envelope.payload) != envelope.checksum {
            return Err(Error::StoreCorruption(
                "state file checksum mismatch".to_string(),
            ));
        }
        let persisted: Records = serde_json::from_str(&envelope.payload)
            .map_err(|e| Error::StoreCorruption(format!("unreadable state records: {e}")))?;
        Records::from_persisted(persisted).map(Some)
    }

    fn write_records(&self) -> Result<()> {
        let payload = serde_json::to_string(&self.records.to_persisted())?;
        let envelope = Envelope {
            version: FORMAT_VERSION,
            checksum: checksum(&payload),
            payload,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&envelope)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote applied state to {}", self.path.display());
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &ObjectKey) -> Option<AppliedRecord> {
        self.records.get(key)
    }

    fn put(&mut self, key: ObjectKey, body: ObjectBody, generation: u64) -> Result<()> {
        self.records.put(key, body, generation)?;
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &ObjectKey) -> Result<()> {
        self.records.delete(key);
        self.dirty = true;
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
        self.dirty = true;
        self.flush()
    }

    fn load(&mut self) -> Result<()> {
        match self.read_records() {
            Ok(Some(records)) => {
                info!(
                    "Loaded {} applied records from {}",
                    records.index.len(),
                    self.path.display()
                );
                self.records = records;
                self.dirty = false;
                Ok(())
            }
            Ok(None) => {
                info!("No state file at {}, starting empty", self.path.display());
                self.records = Records::default();
                Ok(())
            }
            Err(e) => {
                warn!("Discarding state file {}: {}", self.path.display(), e);
                self.records = Records::default();
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.write_records()?;
        self.dirty = false;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
