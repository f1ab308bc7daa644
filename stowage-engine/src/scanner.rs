//! Location scanning: reconcile the index with what a backend actually
//! holds.
//!
//! Listing is one backend call; per-object work (hashing new or changed
//! content) fans out under a per-kind concurrency bound. A re-scan of an
//! unchanged location touches no object data: the size + mtime fast path
//! skips the read entirely.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stowage_core::model::{
    Asset, AssetLocationRecord, LocationId, LocationStatus, SyncState,
};
use stowage_core::{BackendAdapter, BackendError, EngineError, ObjectInfo};

use crate::backend::AdapterFactory;
use crate::config::Limits;
use crate::index::AssetIndex;
use crate::registry::StorageRegistry;
use crate::retry::RetryPolicy;
use crate::ProgressEvent;

#[derive(Default)]
pub struct ScanOptions {
    /// Bypass the size + mtime fast path and re-hash every object.
    pub force: bool,
    pub cancel: CancellationToken,
    pub progress: Option<tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ScanReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub missing: usize,
    /// Per-object failures, `(key, error)`. A failed object never causes its
    /// record to be marked missing.
    pub failed: Vec<(String, String)>,
    /// True when the scan stopped early on cancellation; missing-marking is
    /// skipped because the observation is incomplete.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub scanned: Vec<(LocationId, ScanReport)>,
    pub failed: Vec<(LocationId, String)>,
}

enum Outcome {
    Added,
    Updated,
    Unchanged,
    Failed(String),
    Skipped,
}

pub struct Scanner {
    registry: Arc<StorageRegistry>,
    index: AssetIndex,
    factory: Arc<dyn AdapterFactory>,
    limits: Limits,
}

impl Scanner {
    pub fn new(
        registry: Arc<StorageRegistry>,
        index: AssetIndex,
        factory: Arc<dyn AdapterFactory>,
        limits: Limits,
    ) -> Self {
        Self {
            registry,
            index,
            factory,
            limits,
        }
    }

    /// Scan one location and reconcile its records. Offline locations are
    /// rejected; archived ones may still be read and are scanned normally.
    pub async fn scan_location(
        &self,
        location_id: LocationId,
        options: &ScanOptions,
    ) -> Result<ScanReport, EngineError> {
        let location = self.registry.get(location_id)?;
        if location.status == LocationStatus::Offline {
            return Err(BackendError::Permanent(format!(
                "location '{}' is offline",
                location.name
            ))
            .into());
        }

        let adapter = self.factory.adapter_for(&location)?;
        let limits = self.limits.for_kind(location.kind);
        let policy = RetryPolicy::from_limits(limits);

        let objects = policy.run(|| adapter.list("")).await?;
        let total = objects.len();
        let seen: HashSet<String> = objects.iter().map(|o| o.key.clone()).collect();
        info!(location = %location.name, objects = total, "scan started");

        let semaphore = Arc::new(Semaphore::new(limits.max_concurrent));
        let mut tasks = JoinSet::new();
        for object in objects {
            let semaphore = Arc::clone(&semaphore);
            let adapter = Arc::clone(&adapter);
            let index = self.index.clone();
            let policy = policy.clone();
            let cancel = options.cancel.clone();
            let force = options.force;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (object.key, Outcome::Skipped);
                }
                let key = object.key.clone();
                let outcome =
                    process_object(&index, adapter.as_ref(), &policy, location_id, object, force)
                        .await;
                (key, outcome)
            });
        }

        let mut report = ScanReport::default();
        let mut processed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (key, outcome) = joined.map_err(EngineError::index)?;
            processed += 1;
            match outcome {
                Outcome::Added => report.added += 1,
                Outcome::Updated => report.updated += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Skipped => report.cancelled = true,
                Outcome::Failed(err) => {
                    warn!(location = %location.name, key = %key, error = %err, "object scan failed");
                    report.failed.push((key.clone(), err));
                }
            }
            if let Some(ref progress) = options.progress {
                let _ = progress.send(ProgressEvent::Scan {
                    location_id,
                    processed,
                    total,
                    current: key,
                });
            }
        }

        if report.cancelled {
            info!(location = %location.name, "scan cancelled");
            return Ok(report);
        }

        report.missing = self.index.mark_missing_except(location_id, &seen)?;
        info!(
            location = %location.name,
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            missing = report.missing,
            failed = report.failed.len(),
            "scan complete"
        );
        Ok(report)
    }

    /// Scan every active location in turn. One location failing outright
    /// (unreachable backend, bad credentials) does not stop the others.
    pub async fn discover_all(&self, options: &ScanOptions) -> Result<DiscoveryReport, EngineError> {
        let mut report = DiscoveryReport::default();
        for location in self.registry.list(Some(LocationStatus::Active)) {
            if options.cancel.is_cancelled() {
                break;
            }
            match self.scan_location(location.id, options).await {
                Ok(scan) => report.scanned.push((location.id, scan)),
                Err(e) => {
                    warn!(location = %location.name, error = %e, "location scan failed");
                    report.failed.push((location.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

async fn process_object(
    index: &AssetIndex,
    adapter: &dyn BackendAdapter,
    policy: &RetryPolicy,
    location_id: LocationId,
    object: ObjectInfo,
    force: bool,
) -> Outcome {
    let existing = match index.record_at_path(location_id, &object.key) {
        Ok(record) => record,
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    // Fast path: same size and mtime as last observation means same bytes.
    if !force {
        if let Some(ref record) = existing {
            if record.sync_state != SyncState::Missing
                && record.observed_size_bytes == object.size
                && object.modified == Some(record.last_modified_at)
            {
                let mut refreshed = record.clone();
                refreshed.last_verified_at = Utc::now();
                return match index.upsert_record(&refreshed) {
                    Ok(()) => Outcome::Unchanged,
                    Err(e) => Outcome::Failed(e.to_string()),
                };
            }
        }
    }

    let data = match policy.run(|| adapter.read(&object.key)).await {
        Ok(data) => data,
        Err(e) => return Outcome::Failed(e.to_string()),
    };
    let content_hash = hex::encode(Sha256::digest(&data));
    let now = Utc::now();

    let asset = Asset {
        content_hash: content_hash.clone(),
        size_bytes: data.len() as u64,
        media_type: mime_guess::from_path(&object.key)
            .first_raw()
            .map(|m| m.to_string()),
        created_at: now,
        tags: Default::default(),
        quality: None,
    };
    if let Err(e) = index.upsert_asset(&asset) {
        return Outcome::Failed(e.to_string());
    }

    let superseded = existing
        .as_ref()
        .filter(|record| record.content_hash != content_hash);
    if let Some(old) = superseded {
        // The path now holds different content; retire the old association.
        if let Err(e) =
            index.set_record_state(&old.content_hash, location_id, &object.key, SyncState::Missing)
        {
            return Outcome::Failed(e.to_string());
        }
    }

    let record = AssetLocationRecord {
        content_hash: content_hash.clone(),
        location_id,
        relative_path: object.key.clone(),
        last_verified_at: now,
        last_modified_at: object.modified.unwrap_or(now),
        observed_size_bytes: data.len() as u64,
        sync_state: SyncState::Synced,
    };
    if let Err(e) = index.upsert_record(&record) {
        return Outcome::Failed(e.to_string());
    }

    match existing {
        None => Outcome::Added,
        Some(old) if old.content_hash == content_hash => Outcome::Unchanged,
        Some(_) => Outcome::Updated,
    }
}
