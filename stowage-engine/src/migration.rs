//! Migration planning and execution.
//!
//! Planning is a pure pass over the index: for each asset, compare where it
//! lives against where the rules say it belongs. Execution transfers bytes
//! with verify-before-trust semantics: a moved object's source copy is only
//! deleted after the destination copy has been read back and re-hashed.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stowage_core::model::{
    AssetLocationRecord, LocationId, LocationStatus, MigrationAction, MigrationPlanEntry,
    SyncState,
};
use stowage_core::rules;
use stowage_core::EngineError;

use crate::backend::AdapterFactory;
use crate::config::Limits;
use crate::index::AssetIndex;
use crate::registry::StorageRegistry;
use crate::retry::RetryPolicy;
use crate::ProgressEvent;

#[derive(Debug, Default)]
pub struct MigrationPlan {
    pub entries: Vec<MigrationPlanEntry>,
    /// Assets no active location will accept, with the disqualification
    /// reasons per location.
    pub unplaceable: Vec<(String, String)>,
    /// Assets skipped because an open conflict must be resolved first.
    pub conflicted: Vec<String>,
}

impl MigrationPlan {
    /// True when every asset already sits in its best eligible location.
    pub fn is_converged(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryStatus {
    /// Not executed: dry run, or cancelled before this entry started.
    Planned,
    Completed,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<(MigrationPlanEntry, EntryStatus)>,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| *s == EntryStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| matches!(s, EntryStatus::Failed(_)))
            .count()
    }
}

pub struct ExecuteOptions {
    /// Log what would happen without touching any backend.
    pub dry_run: bool,
    pub max_concurrent: usize,
    pub cancel: CancellationToken,
    pub progress: Option<tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_concurrent: 4,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

#[derive(Clone)]
pub struct Migrator {
    registry: Arc<StorageRegistry>,
    index: AssetIndex,
    factory: Arc<dyn AdapterFactory>,
    limits: Limits,
}

impl Migrator {
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

    /// Compute relocations needed to bring every asset to its best eligible
    /// location. Running plan again after a full execution yields an empty
    /// plan.
    pub fn plan(&self) -> Result<MigrationPlan, EngineError> {
        let locations = self.registry.list(None);
        let now = Utc::now();
        let mut plan = MigrationPlan::default();
        for content_hash in self.index.distinct_hashes()? {
            self.plan_asset(&content_hash, &locations, now, &mut plan)?;
        }
        info!(
            entries = plan.entries.len(),
            unplaceable = plan.unplaceable.len(),
            conflicted = plan.conflicted.len(),
            "migration plan computed"
        );
        Ok(plan)
    }

    fn plan_asset(
        &self,
        content_hash: &str,
        locations: &[stowage_core::model::StorageLocation],
        now: chrono::DateTime<Utc>,
        plan: &mut MigrationPlan,
    ) -> Result<(), EngineError> {
        let asset = match self.index.get_asset(content_hash)? {
            Some(asset) => asset,
            None => return Ok(()),
        };
        let records: Vec<AssetLocationRecord> = self
            .index
            .records_for_asset(content_hash)?
            .into_iter()
            .filter(|r| r.sync_state != SyncState::Missing)
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        if self.index.get_open_conflict(content_hash)?.is_some() {
            plan.conflicted.push(content_hash.to_string());
            return Ok(());
        }

        let eligible = rules::eligible_locations(&asset, locations, now);
        let best = match eligible.first() {
            Some(&best) => best,
            None => {
                let err = EngineError::NoEligibleLocation {
                    content_hash: content_hash.to_string(),
                };
                let reasons: Vec<String> = locations
                    .iter()
                    .filter(|l| l.is_active())
                    .map(|l| rules::explain_disqualification(l, &asset, now))
                    .collect();
                plan.unplaceable
                    .push((content_hash.to_string(), format!("{err}; {}", reasons.join("; "))));
                return Ok(());
            }
        };
        if records.iter().any(|r| r.location_id == best) {
            // Already where it belongs.
            return Ok(());
        }

        // Prefer reading from an active location; fall back to whatever holds
        // a live copy and let execution report the failure.
        let source = records
            .iter()
            .find(|r| {
                locations
                    .iter()
                    .any(|l| l.id == r.location_id && l.is_active())
            })
            .unwrap_or(&records[0]);

        let source_qualifies = eligible.contains(&source.location_id);
        let action = if source_qualifies {
            MigrationAction::Copy
        } else {
            MigrationAction::Move
        };

        let dest_loc = locations
            .iter()
            .find(|l| l.id == best)
            .ok_or_else(|| EngineError::not_found("location", best.to_string()))?;
        let mut reason = rules::explain_qualification(dest_loc, &asset, now);
        if !source_qualifies {
            if let Some(src_loc) = locations.iter().find(|l| l.id == source.location_id) {
                let why = match src_loc.status {
                    LocationStatus::Active => rules::explain_disqualification(src_loc, &asset, now),
                    LocationStatus::Offline => format!("'{}' is offline", src_loc.name),
                    LocationStatus::Archived => format!("'{}' is archived", src_loc.name),
                };
                reason = format!("{reason}; {why}");
            }
        }

        plan.entries.push(MigrationPlanEntry {
            content_hash: content_hash.to_string(),
            source_location_id: source.location_id,
            destination_location_id: best,
            action,
            reason,
        });
        Ok(())
    }

    /// Plan verified moves of every copy of the assets carrying `tag` into
    /// one destination. Copies already at the destination stay put; every
    /// live copy elsewhere is relocated.
    pub fn consolidate(
        &self,
        tag: &str,
        destination: LocationId,
    ) -> Result<MigrationPlan, EngineError> {
        let dest = self.registry.get(destination)?;
        if !dest.is_active() {
            return Err(EngineError::InvalidConfig(format!(
                "consolidation destination '{}' is not active",
                dest.name
            )));
        }

        let mut plan = MigrationPlan::default();
        for content_hash in self.index.hashes_with_tag(tag)? {
            let records: Vec<AssetLocationRecord> = self
                .index
                .records_for_asset(&content_hash)?
                .into_iter()
                .filter(|r| r.sync_state != SyncState::Missing)
                .collect();
            if records.is_empty() {
                plan.unplaceable
                    .push((content_hash, "no live copy to consolidate from".to_string()));
                continue;
            }
            if self.index.get_open_conflict(&content_hash)?.is_some() {
                plan.conflicted.push(content_hash);
                continue;
            }
            for record in records.iter().filter(|r| r.location_id != destination) {
                plan.entries.push(MigrationPlanEntry {
                    content_hash: content_hash.clone(),
                    source_location_id: record.location_id,
                    destination_location_id: destination,
                    action: MigrationAction::Move,
                    reason: format!("consolidating tag '{tag}' into '{}'", dest.name),
                });
            }
        }
        Ok(plan)
    }

    /// Execute a plan. Entries run concurrently under `max_concurrent`; each
    /// entry is independent, so one failure never aborts the batch.
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        options: &ExecuteOptions,
    ) -> Result<ExecutionReport, EngineError> {
        let total = plan.entries.len();
        let mut report = ExecutionReport::default();

        if options.dry_run {
            for entry in &plan.entries {
                info!(
                    content_hash = %entry.content_hash,
                    source = %entry.source_location_id,
                    destination = %entry.destination_location_id,
                    action = ?entry.action,
                    reason = %entry.reason,
                    "dry run"
                );
                report.results.push((entry.clone(), EntryStatus::Planned));
            }
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        for entry in plan.entries.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let cancel = options.cancel.clone();
            let migrator = self.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (entry, EntryStatus::Planned, true);
                }
                let status = match migrator.transfer(&entry).await {
                    Ok(()) => EntryStatus::Completed,
                    Err(e) => EntryStatus::Failed(e.to_string()),
                };
                (entry, status, false)
            });
        }

        let mut processed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (entry, status, skipped) = joined.map_err(EngineError::index)?;
            processed += 1;
            if skipped {
                report.cancelled = true;
            }
            if let Some(ref progress) = options.progress {
                let _ = progress.send(ProgressEvent::Migration {
                    processed,
                    total,
                    current: entry.content_hash.clone(),
                });
            }
            report.results.push((entry, status));
        }

        info!(
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "migration executed"
        );
        Ok(report)
    }

    async fn transfer(&self, entry: &MigrationPlanEntry) -> Result<(), EngineError> {
        let source_loc = self.registry.get(entry.source_location_id)?;
        let dest_loc = self.registry.get(entry.destination_location_id)?;
        let src = self.factory.adapter_for(&source_loc)?;
        let dst = self.factory.adapter_for(&dest_loc)?;
        let src_policy = RetryPolicy::from_limits(self.limits.for_kind(source_loc.kind));
        let dst_policy = RetryPolicy::from_limits(self.limits.for_kind(dest_loc.kind));

        let record = self
            .index
            .records_for_asset(&entry.content_hash)?
            .into_iter()
            .find(|r| {
                r.location_id == entry.source_location_id && r.sync_state != SyncState::Missing
            })
            .ok_or_else(|| EngineError::not_found("source record", entry.content_hash.clone()))?;

        let data = src_policy.run(|| src.read(&record.relative_path)).await?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != entry.content_hash {
            // The source copy itself is corrupt; do not spread it.
            return Err(EngineError::Verification {
                expected: entry.content_hash.clone(),
                actual,
            });
        }

        let dest_key = record.relative_path.clone();
        dst_policy.run(|| dst.write(&dest_key, data.clone())).await?;

        // Verify before trusting the copy: read back and re-hash.
        let readback = dst_policy.run(|| dst.read(&dest_key)).await?;
        let readback_hash = hex::encode(Sha256::digest(&readback));
        if readback_hash != entry.content_hash {
            if let Err(e) = dst_policy.run(|| dst.delete(&dest_key)).await {
                warn!(key = %dest_key, error = %e, "failed to remove unverified destination object");
            }
            return Err(EngineError::Verification {
                expected: entry.content_hash.clone(),
                actual: readback_hash,
            });
        }

        let now = Utc::now();
        let modified = dst_policy
            .run(|| dst.stat(&dest_key))
            .await
            .ok()
            .and_then(|info| info.modified)
            .unwrap_or(now);
        self.index.upsert_record(&AssetLocationRecord {
            content_hash: entry.content_hash.clone(),
            location_id: entry.destination_location_id,
            relative_path: dest_key.clone(),
            last_verified_at: now,
            last_modified_at: modified,
            observed_size_bytes: readback.len() as u64,
            sync_state: SyncState::Synced,
        })?;

        if entry.action == MigrationAction::Move {
            src_policy.run(|| src.delete(&record.relative_path)).await?;
            self.index.set_record_state(
                &entry.content_hash,
                entry.source_location_id,
                &record.relative_path,
                SyncState::Missing,
            )?;
        }

        info!(
            content_hash = %entry.content_hash,
            source = %source_loc.name,
            destination = %dest_loc.name,
            action = ?entry.action,
            "transfer complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultAdapterFactory;
    use crate::registry::NewLocation;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Duration;
    use std::collections::BTreeSet;
    use stowage_core::model::{Asset, ConflictRecord, LocationKind, PlacementRule};
    use stowage_core::{BackendAdapter, BackendError, ObjectInfo};

    struct Fixture {
        registry: Arc<StorageRegistry>,
        index: AssetIndex,
        fast: LocationId,
        archive: LocationId,
        fast_dir: tempfile::TempDir,
        archive_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let fast_dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(StorageRegistry::new());
        let fast = registry
            .register(NewLocation {
                name: "fast".to_string(),
                kind: LocationKind::Local,
                root: fast_dir.path().to_string_lossy().to_string(),
                priority: 100,
                status: LocationStatus::Active,
                rules: vec![PlacementRule {
                    max_age_days: Some(30),
                    ..Default::default()
                }],
            })
            .unwrap();
        let archive = registry
            .register(NewLocation {
                name: "archive".to_string(),
                kind: LocationKind::Local,
                root: archive_dir.path().to_string_lossy().to_string(),
                priority: 50,
                status: LocationStatus::Active,
                rules: vec![],
            })
            .unwrap();
        Fixture {
            registry,
            index: AssetIndex::open_in_memory().unwrap(),
            fast,
            archive,
            fast_dir,
            archive_dir,
        }
    }

    fn migrator(fx: &Fixture) -> Migrator {
        Migrator::new(
            Arc::clone(&fx.registry),
            fx.index.clone(),
            Arc::new(DefaultAdapterFactory::default()),
            Limits::default(),
        )
    }

    /// Place `data` at `path` inside a location, with matching index state
    /// and a created_at `age_days` in the past. Returns the content hash.
    fn seed_asset(
        fx: &Fixture,
        location: LocationId,
        dir: &std::path::Path,
        path: &str,
        data: &[u8],
        age_days: i64,
        tags: &[&str],
    ) -> String {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, data).unwrap();

        let content_hash = hex::encode(Sha256::digest(data));
        fx.index
            .upsert_asset(&Asset {
                content_hash: content_hash.clone(),
                size_bytes: data.len() as u64,
                media_type: None,
                created_at: Utc::now() - Duration::days(age_days),
                tags: tags.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                quality: None,
            })
            .unwrap();
        fx.index
            .upsert_record(&AssetLocationRecord {
                content_hash: content_hash.clone(),
                location_id: location,
                relative_path: path.to_string(),
                last_verified_at: Utc::now(),
                last_modified_at: Utc::now(),
                observed_size_bytes: data.len() as u64,
                sync_state: SyncState::Synced,
            })
            .unwrap();
        content_hash
    }

    #[tokio::test]
    async fn test_plan_moves_aged_asset_off_disqualified_location() {
        let fx = fixture();
        let hash = seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);

        let plan = migrator(&fx).plan().unwrap();
        assert_eq!(plan.entries.len(), 1);
        let entry = &plan.entries[0];
        assert_eq!(entry.content_hash, hash);
        assert_eq!(entry.source_location_id, fx.fast);
        assert_eq!(entry.destination_location_id, fx.archive);
        assert_eq!(entry.action, MigrationAction::Move);
        assert!(entry.reason.contains("'archive' qualified"));
        assert!(entry.reason.contains("'fast' disqualified"));
    }

    #[tokio::test]
    async fn test_plan_leaves_well_placed_assets_alone() {
        let fx = fixture();
        seed_asset(&fx, fx.fast, fx.fast_dir.path(), "new.bin", b"new payload", 2, &[]);
        let plan = migrator(&fx).plan().unwrap();
        assert!(plan.is_converged());
    }

    #[tokio::test]
    async fn test_execute_move_then_plan_converges() {
        let fx = fixture();
        let hash = seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        let m = migrator(&fx);

        let plan = m.plan().unwrap();
        let report = m.execute(&plan, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(report.completed(), 1);
        assert_eq!(report.failed(), 0);

        // Bytes landed at the destination, source object deleted.
        assert_eq!(
            std::fs::read(fx.archive_dir.path().join("old.bin")).unwrap(),
            b"old payload"
        );
        assert!(!fx.fast_dir.path().join("old.bin").exists());

        // Index reflects the move.
        let records = fx.index.records_for_asset(&hash).unwrap();
        let at_archive = records.iter().find(|r| r.location_id == fx.archive).unwrap();
        assert_eq!(at_archive.sync_state, SyncState::Synced);
        let at_fast = records.iter().find(|r| r.location_id == fx.fast).unwrap();
        assert_eq!(at_fast.sync_state, SyncState::Missing);

        // Re-planning finds nothing left to do.
        assert!(m.plan().unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_execute_is_idempotent() {
        let fx = fixture();
        seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        let m = migrator(&fx);

        let plan = m.plan().unwrap();
        m.execute(&plan, &ExecuteOptions::default()).await.unwrap();
        // Executing the same (now stale) plan again fails cleanly on the
        // missing source record without disturbing the destination.
        let second = m.execute(&plan, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(second.failed(), 1);
        assert_eq!(
            std::fs::read(fx.archive_dir.path().join("old.bin")).unwrap(),
            b"old payload"
        );
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let fx = fixture();
        seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        let m = migrator(&fx);

        let plan = m.plan().unwrap();
        let options = ExecuteOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = m.execute(&plan, &options).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].1, EntryStatus::Planned);
        assert!(fx.fast_dir.path().join("old.bin").exists());
        assert!(!fx.archive_dir.path().join("old.bin").exists());
        // The real plan is still there to execute.
        assert_eq!(m.plan().unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_plan_reports_unplaceable() {
        let fx = fixture();
        // Archive refuses small files; fast refuses old ones.
        fx.registry
            .update(
                fx.archive,
                crate::registry::LocationPatch {
                    rules: Some(vec![PlacementRule {
                        min_size_bytes: Some(1_000_000),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            )
            .unwrap();
        let hash = seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"tiny", 45, &[]);

        let plan = migrator(&fx).plan().unwrap();
        assert!(plan.entries.is_empty());
        assert_eq!(plan.unplaceable.len(), 1);
        assert_eq!(plan.unplaceable[0].0, hash);
        assert!(plan.unplaceable[0].1.contains("disqualified"));
    }

    #[tokio::test]
    async fn test_plan_skips_conflicted_assets() {
        let fx = fixture();
        let hash = seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        fx.index
            .open_conflict(&ConflictRecord {
                content_hash: hash.clone(),
                records: vec![],
                strategy: None,
                chosen_location_id: None,
                detected_at: Utc::now(),
                resolved_at: None,
            })
            .unwrap();

        let plan = migrator(&fx).plan().unwrap();
        assert!(plan.entries.is_empty());
        assert_eq!(plan.conflicted, vec![hash]);
    }

    #[tokio::test]
    async fn test_consolidate_moves_tagged_assets() {
        let fx = fixture();
        let tagged =
            seed_asset(&fx, fx.fast, fx.fast_dir.path(), "t.bin", b"tagged", 2, &["project-x"]);
        seed_asset(&fx, fx.fast, fx.fast_dir.path(), "u.bin", b"untagged", 2, &[]);
        // Already at the destination: nothing to do for it.
        let present = seed_asset(
            &fx,
            fx.archive,
            fx.archive_dir.path(),
            "p.bin",
            b"present",
            2,
            &["project-x"],
        );
        let m = migrator(&fx);

        let plan = m.consolidate("project-x", fx.archive).unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].content_hash, tagged);
        assert_eq!(plan.entries[0].action, MigrationAction::Move);
        assert!(plan.entries[0].reason.contains("project-x"));

        let report = m.execute(&plan, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(report.completed(), 1);
        // The tagged copy was relocated; the untagged one stayed.
        assert!(!fx.fast_dir.path().join("t.bin").exists());
        assert!(fx.archive_dir.path().join("t.bin").exists());
        assert!(fx.fast_dir.path().join("u.bin").exists());

        let records = fx.index.records_for_asset(&tagged).unwrap();
        let at_fast = records.iter().find(|r| r.location_id == fx.fast).unwrap();
        assert_eq!(at_fast.sync_state, SyncState::Missing);
        let at_archive = records.iter().find(|r| r.location_id == fx.archive).unwrap();
        assert_eq!(at_archive.sync_state, SyncState::Synced);

        assert_eq!(fx.index.records_for_asset(&present).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consolidate_rejects_inactive_destination() {
        let fx = fixture();
        fx.registry
            .update(
                fx.archive,
                crate::registry::LocationPatch {
                    status: Some(LocationStatus::Offline),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            migrator(&fx).consolidate("any", fx.archive),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    // Adapter whose writes silently store garbage. Models a destination that
    // corrupts data in flight.
    struct CorruptingAdapter {
        inner: Arc<dyn BackendAdapter>,
    }

    #[async_trait]
    impl BackendAdapter for CorruptingAdapter {
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
            self.inner.list(prefix).await
        }
        async fn stat(&self, key: &str) -> Result<ObjectInfo, BackendError> {
            self.inner.stat(key).await
        }
        async fn read(&self, key: &str) -> Result<Bytes, BackendError> {
            self.inner.read(key).await
        }
        async fn write(&self, key: &str, _data: Bytes) -> Result<(), BackendError> {
            self.inner.write(key, Bytes::from_static(b"garbage")).await
        }
        async fn delete(&self, key: &str) -> Result<(), BackendError> {
            self.inner.delete(key).await
        }
    }

    struct CorruptingFactory {
        inner: DefaultAdapterFactory,
        target: LocationId,
    }

    impl AdapterFactory for CorruptingFactory {
        fn adapter_for(
            &self,
            location: &stowage_core::model::StorageLocation,
        ) -> Result<Arc<dyn BackendAdapter>, EngineError> {
            let adapter = self.inner.adapter_for(location)?;
            if location.id == self.target {
                Ok(Arc::new(CorruptingAdapter { inner: adapter }))
            } else {
                Ok(adapter)
            }
        }
    }

    #[tokio::test]
    async fn test_failed_verification_leaves_source_untouched() {
        let fx = fixture();
        let hash = seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        let m = Migrator::new(
            Arc::clone(&fx.registry),
            fx.index.clone(),
            Arc::new(CorruptingFactory {
                inner: DefaultAdapterFactory::default(),
                target: fx.archive,
            }),
            Limits::default(),
        );

        let plan = m.plan().unwrap();
        assert_eq!(plan.entries[0].action, MigrationAction::Move);
        let report = m.execute(&plan, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(report.failed(), 1);
        match &report.results[0].1 {
            EntryStatus::Failed(msg) => assert!(msg.contains("verification failed")),
            other => panic!("unexpected status: {other:?}"),
        }

        // Source object and record are intact; the bad copy was removed.
        assert!(fx.fast_dir.path().join("old.bin").exists());
        assert!(!fx.archive_dir.path().join("old.bin").exists());
        let records = fx.index.records_for_asset(&hash).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location_id, fx.fast);
        assert_eq!(records[0].sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_cancelled_execution_marks_entries_planned() {
        let fx = fixture();
        seed_asset(&fx, fx.fast, fx.fast_dir.path(), "old.bin", b"old payload", 45, &[]);
        let m = migrator(&fx);

        let plan = m.plan().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = ExecuteOptions {
            cancel,
            ..Default::default()
        };
        let report = m.execute(&plan, &options).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.completed(), 0);
        assert!(fx.fast_dir.path().join("old.bin").exists());
    }
}
