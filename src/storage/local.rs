//! Lake storage on the local filesystem.
//!
//! Blobs are files below a root directory. Writes go to a temporary sibling
//! first and are renamed into place, so readers never see a torn partition.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use url::Url;
use uuid::Uuid;

use super::{LakeStorage, StorageError, validate_path};

#[derive(Debug, Clone)]
pub struct LocalLakeStorage {
    root: PathBuf,
}

impl LocalLakeStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, segment| acc.join(segment)))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(segments?.join("/"))
    }
}

fn io_error(path: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_string(),
        source,
    }
}

async fn ensure_parent(target: &Path, path: &str) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(io_error(path))?;
    }
    Ok(())
}

#[async_trait]
impl LakeStorage for LocalLakeStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        ensure_parent(&target, path).await?;

        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(format!(".tmp-{}", Uuid::new_v4()));
        let temp = PathBuf::from(temp_name);

        fs::write(&temp, bytes).await.map_err(io_error(path))?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(path)(e));
        }

        let absolute = fs::canonicalize(&target).await.map_err(io_error(path))?;
        Ok(Url::from_file_path(&absolute)
            .map(String::from)
            .unwrap_or_else(|_| absolute.display().to_string()))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let start = self.resolve(prefix)?;
        let mut pending = vec![start];
        let mut found = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix)(e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(io_error(prefix))? {
                let file_type = entry.file_type().await.map_err(io_error(prefix))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(relative) = self.relative(&path) {
                    if !relative.contains(".tmp-") {
                        found.push(relative);
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        ensure_parent(&target, to).await?;

        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(from)(e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let target = self.resolve(prefix)?;
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(prefix)(e)),
        }
    }
}
