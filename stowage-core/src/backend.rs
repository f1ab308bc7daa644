use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error from a single backend operation, before any retry policy is applied.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network timeouts, connection failures, throttling. Retryable.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Authorization failures, malformed requests. Surfaced immediately.
    #[error("backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Listing/stat metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Key relative to the location root.
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Uniform interface over a physical storage medium.
///
/// Adapters handle raw I/O only; placement decisions, retry/backoff,
/// concurrency bounds, and state tracking belong to the calling engine.
/// Every operation may incur network latency; callers wrap each call in a
/// per-kind timeout and retry policy.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    /// List all objects under the given prefix, relative to the root.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError>;

    /// Metadata for a single object.
    async fn stat(&self, key: &str) -> Result<ObjectInfo, BackendError>;

    async fn read(&self, key: &str) -> Result<Bytes, BackendError>;

    async fn write(&self, key: &str, data: Bytes) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
