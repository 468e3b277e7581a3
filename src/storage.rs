// src/storage.rs

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;

use crate::error::Result;

/// Snapshot key of the ledger mirror.
pub const LEDGER_MIRROR_KEY: &str = "ledger-mirror";
/// Snapshot key of the bound user session.
pub const USER_SESSION_KEY: &str = "user-session";

/// Key-value store holding serialized snapshots.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, key: &str, blob: &[u8]) -> Result<()>;
    fn load_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete_snapshot(&self, key: &str) -> Result<()>;
}

/// Serializes `value` as JSON under `key`.
pub fn save_json<T: Serialize>(store: &dyn SnapshotStore, key: &str, value: &T) -> Result<()> {
    let blob = serde_json::to_vec(value)?;
    store.save_snapshot(key, &blob)
}

pub fn load_json<T: DeserializeOwned>(store: &dyn SnapshotStore, key: &str) -> Result<Option<T>> {
    match store.load_snapshot(key)? {
        Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
        None => Ok(None),
    }
}

/// Snapshot store backed by a sled database.
#[derive(Clone)]
pub struct SledSnapshotStore {
    db: Db,
}

impl SledSnapshotStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Database that lives only as long as the process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn save_snapshot(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.db.insert(key.as_bytes(), blob)?;
        self.db.flush()?;
        Ok(())
    }

    fn load_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|ivec| ivec.to_vec()))
    }

    fn delete_snapshot(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }
}
