use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Pluggable key-value storage underneath the cache store.
///
/// The engine treats any backend as eventually-consistent key-value storage;
/// which one to use is a configuration concern, not engine logic.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn len(&self) -> Result<usize>;
}

/// Process-local map backend.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Embedded on-disk backend backed by sled.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Cache {
            operation: "open".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CacheBackend for SledBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(key).map_err(|e| Error::Cache {
            operation: "get".to_string(),
            reason: e.to_string(),
        })?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key, value).map_err(|e| Error::Cache {
            operation: "set".to_string(),
            reason: e.to_string(),
        })?;
        // Mutations are durable from the caller's perspective
        self.db.flush_async().await.map_err(|e| Error::Cache {
            operation: "flush".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key).map_err(|e| Error::Cache {
            operation: "delete".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item.map_err(|e| Error::Cache {
                operation: "scan".to_string(),
                reason: e.to_string(),
            })?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.db.len())
    }
}
