//! Keyed-record storage for waltz engine state.
//!
//! Pairings, sessions, and pending proposals are persisted through the
//! [`RecordStore`] interface so a client survives process restarts. The
//! in-memory backend serves tests and throwaway clients; the file backend
//! keeps one JSON document per collection with atomic tmp+rename writes.
//! Key material never goes through this interface (see `waltz-kms`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    #[error("invalid collection name: {name}")]
    InvalidCollection { name: String },

    #[error("corrupt record in {collection}/{id}: {reason}")]
    Corrupt { collection: String, id: String, reason: String },
}

/// Keyed-record mapping: collection × id → JSON record.
pub trait RecordStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError>;
    fn set(&self, collection: &str, id: &str, record: Value) -> Result<(), StorageError>;
    fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError>;
    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>, StorageError>;
}

/// Typed facade over a [`RecordStore`].
#[derive(Clone)]
pub struct Records {
    inner: Arc<dyn RecordStore>,
}

impl Records {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self { inner }
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.inner.get(collection, id)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                StorageError::Corrupt {
                    collection: collection.to_owned(),
                    id: id.to_owned(),
                    reason: err.to_string(),
                }
            }),
        }
    }

    pub fn set<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(record)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })?;
        self.inner.set(collection, id, value)
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        self.inner.delete(collection, id)
    }

    pub fn get_all<T: DeserializeOwned>(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let mut records = Vec::new();
        for (id, value) in self.inner.get_all(collection)? {
            let record = serde_json::from_value(value).map_err(|err| StorageError::Corrupt {
                collection: collection.to_owned(),
                id: id.clone(),
                reason: err.to_string(),
            })?;
            records.push((id, record));
        }
        Ok(records)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        Ok(collections.get(collection).and_then(|records| records.get(id)).cloned())
    }

    fn set(&self, collection: &str, id: &str, record: Value) -> Result<(), StorageError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        collections.entry(collection.to_owned()).or_default().insert(id.to_owned(), record);
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        if let Some(records) = collections.get_mut(collection) {
            records.remove(id);
        }
        Ok(())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        Ok(collections
            .get(collection)
            .map(|records| records.iter().map(|(id, value)| (id.clone(), value.clone())).collect())
            .unwrap_or_default())
    }
}

/// One JSON document per collection under `root`, written atomically.
pub struct FileStore {
    root: PathBuf,
    lock: RwLock<()>,
}

fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|character| {
            character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.')
        })
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })?;
        Ok(Self { root, lock: RwLock::new(()) })
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_collection(collection) {
            return Err(StorageError::InvalidCollection { name: collection.to_owned() });
        }
        Ok(self.root.join(format!("{collection}.json")))
    }

    fn read_collection(&self, collection: &str) -> Result<BTreeMap<String, Value>, StorageError> {
        let path = self.path_for(collection)?;
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = std::fs::read(&path)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })?;
        serde_json::from_slice(&bytes).map_err(|err| StorageError::Corrupt {
            collection: collection.to_owned(),
            id: String::new(),
            reason: err.to_string(),
        })
    }

    fn write_collection(
        &self,
        collection: &str,
        records: &BTreeMap<String, Value>,
    ) -> Result<(), StorageError> {
        let path = self.path_for(collection)?;
        let tmp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec(records)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })?;
        std::fs::write(&tmp_path, bytes)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })?;
        std::fs::rename(&tmp_path, &path)
            .map_err(|err| StorageError::Backend { reason: err.to_string() })
    }
}

impl RecordStore for FileStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        Ok(self.read_collection(collection)?.remove(id))
    }

    fn set(&self, collection: &str, id: &str, record: Value) -> Result<(), StorageError> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        let mut records = self.read_collection(collection)?;
        records.insert(id.to_owned(), record);
        self.write_collection(collection, &records)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        let mut records = self.read_collection(collection)?;
        if records.remove(id).is_some() {
            self.write_collection(collection, &records)?;
        }
        Ok(())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| StorageError::Backend { reason: "store lock poisoned".into() })?;
        Ok(self.read_collection(collection)?.into_iter().collect())
    }
}
