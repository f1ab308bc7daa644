//! Backend adapter construction.
//!
//! Adapters are built per storage location from its kind, root and
//! credentials. The factory sits behind a trait so tests can inject
//! misbehaving adapters without touching real storage.

pub mod gcs;
pub mod local;
pub mod s3;

use std::collections::HashMap;
use std::sync::Arc;

use stowage_core::model::{LocationKind, StorageLocation};
use stowage_core::{BackendAdapter, EngineError};

use crate::config::{CredentialConfig, EngineConfig};

pub use gcs::GcsAdapter;
pub use local::LocalAdapter;
pub use s3::{S3Adapter, S3Config};

pub trait AdapterFactory: Send + Sync {
    fn adapter_for(
        &self,
        location: &StorageLocation,
    ) -> Result<Arc<dyn BackendAdapter>, EngineError>;
}

/// Builds real adapters. Credentials are looked up by the location's
/// immutable `(kind, root)` pair, falling back to ambient environment
/// variables when the config carries none.
#[derive(Default)]
pub struct DefaultAdapterFactory {
    credentials: HashMap<(LocationKind, String), CredentialConfig>,
}

impl DefaultAdapterFactory {
    pub fn from_config(config: &EngineConfig) -> Self {
        let credentials = config
            .locations
            .iter()
            .filter_map(|decl| {
                decl.credentials.as_ref().map(|creds| {
                    (
                        (decl.kind, decl.root.trim_end_matches('/').to_string()),
                        creds.clone(),
                    )
                })
            })
            .collect();
        Self { credentials }
    }

    fn credentials_for(&self, location: &StorageLocation) -> CredentialConfig {
        self.credentials
            .get(&(location.kind, location.root.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn adapter_for(
        &self,
        location: &StorageLocation,
    ) -> Result<Arc<dyn BackendAdapter>, EngineError> {
        match location.kind {
            LocationKind::Local => Ok(Arc::new(LocalAdapter::new(&location.root))),
            LocationKind::S3 => {
                let creds = self.credentials_for(location);
                let (bucket, prefix) = split_bucket_root(&location.root);
                let access_key_id = creds
                    .access_key_id
                    .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                    .ok_or_else(|| missing_credential(location, "access_key_id"))?;
                let secret_access_key = creds
                    .secret_access_key
                    .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                    .ok_or_else(|| missing_credential(location, "secret_access_key"))?;
                let region = creds
                    .region
                    .or_else(|| std::env::var("AWS_REGION").ok())
                    .unwrap_or_else(|| "us-east-1".to_string());
                Ok(Arc::new(S3Adapter::new(S3Config {
                    bucket,
                    prefix,
                    region,
                    endpoint: creds.endpoint,
                    access_key_id,
                    secret_access_key,
                })))
            }
            LocationKind::Gcs => {
                let creds = self.credentials_for(location);
                let (bucket, prefix) = split_bucket_root(&location.root);
                let token = creds
                    .token
                    .or_else(|| std::env::var("GCS_BEARER_TOKEN").ok());
                Ok(Arc::new(GcsAdapter::new(
                    bucket,
                    prefix,
                    token,
                    creds.endpoint,
                )))
            }
        }
    }
}

/// An object-store root is `bucket` or `bucket/prefix`.
fn split_bucket_root(root: &str) -> (String, String) {
    match root.split_once('/') {
        Some((bucket, prefix)) => (bucket.to_string(), prefix.trim_end_matches('/').to_string()),
        None => (root.to_string(), String::new()),
    }
}

fn missing_credential(location: &StorageLocation, field: &str) -> EngineError {
    EngineError::InvalidConfig(format!(
        "location '{}' ({}) needs {field} in config or environment",
        location.name, location.kind
    ))
}
