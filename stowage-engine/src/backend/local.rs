//! Local filesystem backend adapter.
//!
//! Writes are atomic: temp file in the destination directory, fsync, then
//! rename. A reader never observes a partially written object.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use stowage_core::{BackendAdapter, BackendError, ObjectInfo};

pub struct LocalAdapter {
    base_path: PathBuf,
}

impl LocalAdapter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        // Build the path one component at a time, dropping empty, "." and
        // ".." segments so the result can never leave `base_path`. Joining
        // the raw key would let a leading "/" or "../" escape the root.
        let mut path = self.base_path.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            path.push(part);
        }
        path
    }
}

fn io_error(key: &str, err: std::io::Error) -> BackendError {
    match err.kind() {
        std::io::ErrorKind::NotFound => BackendError::NotFound(key.to_string()),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
            BackendError::Transient(format!("{key}: {err}"))
        }
        _ => BackendError::Permanent(format!("{key}: {err}")),
    }
}

fn modified_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        let search_dir = self.base_path.join(prefix.trim_start_matches('/'));
        let base = &self.base_path;

        let mut objects = Vec::new();
        if !search_dir.exists() {
            return Ok(objects);
        }

        let mut stack = vec![search_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(&dir.to_string_lossy(), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&dir.to_string_lossy(), e))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error(&path.to_string_lossy(), e))?;

                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() {
                    if let Ok(relative) = path.strip_prefix(base) {
                        objects.push(ObjectInfo {
                            key: relative.to_string_lossy().to_string(),
                            size: meta.len(),
                            modified: modified_time(&meta),
                        });
                    }
                }
            }
        }

        Ok(objects)
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, BackendError> {
        let path = self.full_path(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(key, e))?;
        if !meta.is_file() {
            return Err(BackendError::NotFound(key.to_string()));
        }
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            modified: modified_time(&meta),
        })
    }

    async fn read(&self, key: &str) -> Result<Bytes, BackendError> {
        let path = self.full_path(key);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<(), BackendError> {
        let dest = self.full_path(key);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }

        // Write to temp file, fsync, then rename (atomic). The temp name
        // carries a random suffix so concurrent writes to keys sharing a
        // stem never collide, and no real object name can be shadowed.
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object".to_string());
        let tmp_path = dest.with_file_name(format!(
            ".{file_name}.{:08x}.tmp",
            rand::random::<u32>()
        ));
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| io_error(key, e))?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(|e| io_error(key, e))?;
        file.sync_all().await.map_err(|e| io_error(key, e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest)
            .await
            .map_err(|e| io_error(key, e))?;

        debug!(key = %key, size = data.len(), "local write complete");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.full_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "local delete complete");
                Ok(())
            }
            // Delete is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}
