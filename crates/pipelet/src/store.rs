//! Backing object store seam.
//!
//! Serialized parameter values live here between tasks, keyed by stable
//! identifier. The executor's loader and write-back calls go through this
//! interface only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::SerializationError;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<Vec<u8>, SerializationError>;
    async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), SerializationError>;
}

/// Serialize a value the way the store expects it (compact JSON).
pub fn to_bytes(id: &str, value: &serde_json::Value) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(value).map_err(|e| SerializationError::write(id, e))
}

/// Deserialize store bytes back into a value.
pub fn from_bytes(id: &str, bytes: &[u8]) -> Result<serde_json::Value, SerializationError> {
    serde_json::from_slice(bytes).map_err(|e| SerializationError::decode(id, e))
}

/// In-memory store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&self, id: &str, value: &serde_json::Value) {
        let bytes = serde_json::to_vec(value).expect("json value serializes");
        self.objects
            .lock()
            .expect("store lock")
            .insert(id.to_string(), bytes);
    }

    pub fn get_value(&self, id: &str) -> Option<serde_json::Value> {
        let objects = self.objects.lock().expect("store lock");
        objects.get(id).and_then(|b| serde_json::from_slice(b).ok())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, id: &str) -> Result<Vec<u8>, SerializationError> {
        self.objects
            .lock()
            .expect("store lock")
            .get(id)
            .cloned()
            .ok_or_else(|| SerializationError::read(id, "no such object"))
    }

    async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), SerializationError> {
        self.objects
            .lock()
            .expect("store lock")
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Filesystem store: one file per identifier under a root directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Identifiers are single wire tokens; anything path-like is rejected
    /// rather than resolved outside the root.
    fn object_path(&self, id: &str) -> Result<PathBuf, SerializationError> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(SerializationError::read(id, "invalid identifier"));
        }
        Ok(self.root.join(id))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsStore {
    async fn read(&self, id: &str) -> Result<Vec<u8>, SerializationError> {
        let path = self.object_path(id)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| SerializationError::read(id, e))
    }

    async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), SerializationError> {
        let path = self.object_path(id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SerializationError::write(id, e))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SerializationError::write(id, e))
    }
}
