//! Cross-location synchronization state and conflict handling.
//!
//! Copies of one asset are expected to present identical metadata. When the
//! observed sizes diverge, or the modification times spread further apart
//! than the clock-skew tolerance, the copies have drifted since they were
//! last hashed: the tracker marks every copy `conflict` and opens a conflict
//! record that blocks migration of that asset until resolved.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use stowage_core::model::{
    AssetLocationRecord, ConflictRecord, LocationId, ResolutionOutcome, ResolutionStrategy,
    SyncState,
};
use stowage_core::EngineError;

use crate::index::AssetIndex;
use crate::registry::StorageRegistry;

pub struct SyncTracker {
    registry: Arc<StorageRegistry>,
    index: AssetIndex,
    skew_tolerance: Duration,
}

impl SyncTracker {
    pub fn new(registry: Arc<StorageRegistry>, index: AssetIndex, skew_tolerance_secs: i64) -> Self {
        Self {
            registry,
            index,
            skew_tolerance: Duration::seconds(skew_tolerance_secs),
        }
    }

    /// Sweep every multi-copy asset for divergence. Idempotent: a hash with
    /// an already-open conflict is reported but not re-opened.
    pub fn detect_conflicts(&self) -> Result<Vec<ConflictRecord>, EngineError> {
        let mut detected = Vec::new();
        for content_hash in self.index.distinct_hashes()? {
            let records: Vec<AssetLocationRecord> = self
                .index
                .records_for_asset(&content_hash)?
                .into_iter()
                .filter(|r| r.sync_state != SyncState::Missing)
                .collect();
            if records.len() < 2 || !self.diverging(&records) {
                continue;
            }

            for record in &records {
                if record.sync_state != SyncState::Conflict {
                    self.index.set_record_state(
                        &record.content_hash,
                        record.location_id,
                        &record.relative_path,
                        SyncState::Conflict,
                    )?;
                }
            }
            let conflict = self.index.open_conflict(&ConflictRecord {
                content_hash: content_hash.clone(),
                records,
                strategy: None,
                chosen_location_id: None,
                detected_at: Utc::now(),
                resolved_at: None,
            })?;
            warn!(content_hash = %content_hash, copies = conflict.records.len(), "conflict detected");
            detected.push(conflict);
        }
        Ok(detected)
    }

    fn diverging(&self, records: &[AssetLocationRecord]) -> bool {
        let sizes_differ = records
            .windows(2)
            .any(|w| w[0].observed_size_bytes != w[1].observed_size_bytes);
        if sizes_differ {
            return true;
        }
        let newest = records.iter().map(|r| r.last_modified_at).max();
        let oldest = records.iter().map(|r| r.last_modified_at).min();
        match (newest, oldest) {
            (Some(newest), Some(oldest)) => newest - oldest > self.skew_tolerance,
            _ => false,
        }
    }

    /// Resolve the open conflict for a hash with an automatic strategy.
    ///
    /// The winning copy is marked `synced` and the conflict closed; losing
    /// copies keep their `conflict` state so a later scan re-verifies them.
    /// The `manual` strategy only records the choice of strategy: the
    /// conflict stays open until [`resolve_manual`] supplies a decision.
    ///
    /// [`resolve_manual`]: SyncTracker::resolve_manual
    pub fn resolve(
        &self,
        content_hash: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionOutcome, EngineError> {
        self.index
            .get_open_conflict(content_hash)?
            .ok_or_else(|| EngineError::not_found("open conflict", content_hash))?;

        if strategy == ResolutionStrategy::Manual {
            self.index
                .set_conflict_strategy(content_hash, ResolutionStrategy::Manual)?;
            info!(content_hash = %content_hash, "conflict awaiting manual decision");
            return Ok(ResolutionOutcome {
                content_hash: content_hash.to_string(),
                strategy,
                chosen_location_id: None,
                resolved_at: None,
            });
        }

        // Choose among the copies as they stand now, not the snapshot.
        let candidates: Vec<AssetLocationRecord> = self
            .index
            .records_for_asset(content_hash)?
            .into_iter()
            .filter(|r| r.sync_state != SyncState::Missing)
            .collect();
        if candidates.is_empty() {
            return Err(EngineError::ConflictUnresolved(format!(
                "{content_hash}: no live copies left to choose from"
            )));
        }

        let chosen = match strategy {
            ResolutionStrategy::Newest => pick(&candidates, |r| r.last_modified_at),
            ResolutionStrategy::Largest => pick(&candidates, |r| r.observed_size_bytes),
            ResolutionStrategy::Primary => {
                pick(&candidates, |r| self.location_priority(r.location_id))
            }
            ResolutionStrategy::Manual => unreachable!("handled above"),
        };

        self.close(content_hash, strategy, &chosen)?;
        Ok(ResolutionOutcome {
            content_hash: content_hash.to_string(),
            strategy,
            chosen_location_id: Some(chosen.location_id),
            resolved_at: Some(Utc::now()),
        })
    }

    /// Close an open conflict with an externally supplied winner. The winner
    /// must be one of the live copies.
    pub fn resolve_manual(
        &self,
        content_hash: &str,
        chosen_location: LocationId,
    ) -> Result<ResolutionOutcome, EngineError> {
        self.index
            .get_open_conflict(content_hash)?
            .ok_or_else(|| EngineError::not_found("open conflict", content_hash))?;

        let chosen = self
            .index
            .records_for_asset(content_hash)?
            .into_iter()
            .filter(|r| r.sync_state != SyncState::Missing)
            .find(|r| r.location_id == chosen_location)
            .ok_or_else(|| {
                EngineError::not_found("live copy at chosen location", chosen_location.to_string())
            })?;

        self.close(content_hash, ResolutionStrategy::Manual, &chosen)?;
        Ok(ResolutionOutcome {
            content_hash: content_hash.to_string(),
            strategy: ResolutionStrategy::Manual,
            chosen_location_id: Some(chosen.location_id),
            resolved_at: Some(Utc::now()),
        })
    }

    pub fn list_conflicts(&self, open_only: bool) -> Result<Vec<ConflictRecord>, EngineError> {
        self.index.list_conflicts(open_only)
    }

    fn close(
        &self,
        content_hash: &str,
        strategy: ResolutionStrategy,
        chosen: &AssetLocationRecord,
    ) -> Result<(), EngineError> {
        self.index.set_record_state(
            content_hash,
            chosen.location_id,
            &chosen.relative_path,
            SyncState::Synced,
        )?;
        self.index
            .mark_resolved(content_hash, strategy, chosen.location_id)?;
        info!(
            content_hash = %content_hash,
            strategy = %strategy.as_str(),
            chosen = %chosen.location_id,
            "conflict resolved"
        );
        Ok(())
    }

    fn location_priority(&self, id: LocationId) -> i32 {
        self.registry.get(id).map(|l| l.priority).unwrap_or(i32::MIN)
    }
}

/// Deterministic argmax: the first record with the maximal key wins, and
/// records arrive from the index in a stable order.
fn pick<K: Ord + Copy>(
    records: &[AssetLocationRecord],
    key: impl Fn(&AssetLocationRecord) -> K,
) -> AssetLocationRecord {
    let mut best = &records[0];
    for record in &records[1..] {
        if key(record) > key(best) {
            best = record;
        }
    }
    best.clone()
}
