use crate::backend::BackendError;
use crate::model::LocationKind;

/// Engine-wide error taxonomy.
///
/// Transient backend failures are retried at the adapter-call layer and only
/// surface here as `BackendUnavailable` once retries are exhausted. Batch
/// operations collect per-item failures instead of returning these directly.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("location ({kind}, {root}) is already registered")]
    DuplicateLocation { kind: LocationKind, root: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("no eligible location for asset {content_hash} and no fallback sink is configured")]
    NoEligibleLocation { content_hash: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error("post-write verification failed: expected {expected}, read back {actual}")]
    Verification { expected: String, actual: String },

    #[error("asset {0} has an open conflict awaiting resolution")]
    ConflictUnresolved(String),

    #[error("removing location {0} requires explicit confirmation")]
    ConfirmationRequired(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("asset index error: {0}")]
    Index(String),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Wrap a storage-layer error from the asset index.
    pub fn index(err: impl std::fmt::Display) -> Self {
        EngineError::Index(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::DuplicateLocation {
            kind: LocationKind::S3,
            root: "bucket-x".to_string(),
        };
        assert_eq!(err.to_string(), "location (s3, bucket-x) is already registered");

        let err = EngineError::not_found("location", "abc");
        assert_eq!(err.to_string(), "location not found: abc");
    }

    #[test]
    fn test_backend_error_conversion() {
        let err: EngineError = BackendError::Transient("connect timeout".to_string()).into();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));
    }
}
