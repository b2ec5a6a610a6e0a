//! In-process lake storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{LakeStorage, StorageError, validate_path};

#[derive(Debug, Default)]
pub struct MemoryLakeStorage {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLakeStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn under(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[async_trait]
impl LakeStorage for MemoryLakeStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_path(path)?;
        self.blobs.write().await.insert(path.to_string(), bytes.to_vec());
        Ok(format!("memory:///{path}"))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_path(path)?;
        Ok(self.blobs.read().await.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_path(prefix)?;
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|path| under(prefix, path))
            .cloned()
            .collect())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        validate_path(from)?;
        validate_path(to)?;
        let mut blobs = self.blobs.write().await;
        if let Some(bytes) = blobs.remove(from) {
            blobs.insert(to.to_string(), bytes);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        validate_path(prefix)?;
        self.blobs.write().await.retain(|path, _| !under(prefix, path));
        Ok(())
    }
}
