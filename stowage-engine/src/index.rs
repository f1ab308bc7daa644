//! Durable asset index backed by SQLite.
//!
//! Single source of truth for assets, their per-location records, and
//! conflict history. The connection is wrapped in a mutex; all access goes
//! through short synchronous critical sections so async callers never hold
//! the lock across an await point.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use stowage_core::model::{
    Asset, AssetLocationRecord, ConflictRecord, LocationId, ResolutionStrategy, SyncState,
};
use stowage_core::EngineError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    content_hash  TEXT PRIMARY KEY,
    size_bytes    INTEGER NOT NULL,
    media_type    TEXT,
    created_at    TEXT NOT NULL,
    tags          TEXT NOT NULL DEFAULT '[]',
    quality       REAL
);

CREATE TABLE IF NOT EXISTS asset_locations (
    content_hash         TEXT NOT NULL,
    location_id          TEXT NOT NULL,
    relative_path        TEXT NOT NULL,
    last_verified_at     TEXT NOT NULL,
    last_modified_at     TEXT NOT NULL,
    observed_size_bytes  INTEGER NOT NULL,
    sync_state           TEXT NOT NULL,
    PRIMARY KEY (content_hash, location_id, relative_path)
);

CREATE INDEX IF NOT EXISTS idx_location_path
    ON asset_locations (location_id, relative_path);

CREATE TABLE IF NOT EXISTS conflicts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash        TEXT NOT NULL,
    records             TEXT NOT NULL,
    strategy            TEXT,
    chosen_location_id  TEXT,
    detected_at         TEXT NOT NULL,
    resolved_at         TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_open_conflict
    ON conflicts (content_hash) WHERE resolved_at IS NULL;
"#;

#[derive(Clone)]
pub struct AssetIndex {
    conn: Arc<Mutex<Connection>>,
}

impl AssetIndex {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(EngineError::index)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(EngineError::index)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(EngineError::index)?;
        Self::init(conn)
    }

    /// In-memory index, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(EngineError::index)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch(SCHEMA).map_err(EngineError::index)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("index lock poisoned")
    }

    // ── Assets ──

    /// Insert the asset, or refresh `size_bytes`/`media_type` if the hash is
    /// already known. `created_at`, tags and quality are sticky: first
    /// observation wins, later edits go through [`set_asset_attributes`].
    ///
    /// [`set_asset_attributes`]: AssetIndex::set_asset_attributes
    pub fn upsert_asset(&self, asset: &Asset) -> Result<(), EngineError> {
        let tags = serde_json::to_string(&asset.tags).map_err(EngineError::index)?;
        self.lock()
            .execute(
                "INSERT INTO assets (content_hash, size_bytes, media_type, created_at, tags, quality)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (content_hash) DO UPDATE SET
                     size_bytes = excluded.size_bytes,
                     media_type = COALESCE(excluded.media_type, assets.media_type)",
                params![
                    asset.content_hash,
                    asset.size_bytes as i64,
                    asset.media_type,
                    ts(asset.created_at),
                    tags,
                    asset.quality,
                ],
            )
            .map_err(EngineError::index)?;
        Ok(())
    }

    pub fn get_asset(&self, content_hash: &str) -> Result<Option<Asset>, EngineError> {
        self.lock()
            .query_row(
                "SELECT content_hash, size_bytes, media_type, created_at, tags, quality
                 FROM assets WHERE content_hash = ?1",
                params![content_hash],
                asset_from_row,
            )
            .optional()
            .map_err(EngineError::index)?
            .transpose()
    }

    /// Update the mutable attributes of an asset (tags and quality score).
    pub fn set_asset_attributes(
        &self,
        content_hash: &str,
        tags: &std::collections::BTreeSet<String>,
        quality: Option<f64>,
    ) -> Result<(), EngineError> {
        let tags_json = serde_json::to_string(tags).map_err(EngineError::index)?;
        let changed = self
            .lock()
            .execute(
                "UPDATE assets SET tags = ?2, quality = ?3 WHERE content_hash = ?1",
                params![content_hash, tags_json, quality],
            )
            .map_err(EngineError::index)?;
        if changed == 0 {
            return Err(EngineError::not_found("asset", content_hash));
        }
        Ok(())
    }

    pub fn distinct_hashes(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT content_hash FROM assets ORDER BY content_hash")
            .map_err(EngineError::index)?;
        let hashes = stmt
            .query_map([], |row| row.get(0))
            .map_err(EngineError::index)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(EngineError::index)?;
        Ok(hashes)
    }

    /// Hashes of assets carrying `tag`. Tags are stored as a JSON array, so
    /// the filter runs in Rust rather than in SQL.
    pub fn hashes_with_tag(&self, tag: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT content_hash, tags FROM assets ORDER BY content_hash")
            .map_err(EngineError::index)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(EngineError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::index)?;
        let mut hashes = Vec::new();
        for (hash, tags_json) in rows {
            let tags: std::collections::BTreeSet<String> =
                serde_json::from_str(&tags_json).map_err(EngineError::index)?;
            if tags.contains(tag) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    // ── Location records ──

    pub fn upsert_record(&self, record: &AssetLocationRecord) -> Result<(), EngineError> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO asset_locations
                     (content_hash, location_id, relative_path, last_verified_at,
                      last_modified_at, observed_size_bytes, sync_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.content_hash,
                    record.location_id.to_string(),
                    record.relative_path,
                    ts(record.last_verified_at),
                    ts(record.last_modified_at),
                    record.observed_size_bytes as i64,
                    record.sync_state.as_str(),
                ],
            )
            .map_err(EngineError::index)?;
        Ok(())
    }

    /// The live record at a given path within a location. A path can carry a
    /// retired (missing) row from before its content changed; the non-missing
    /// row wins, then the most recently verified.
    pub fn record_at_path(
        &self,
        location_id: LocationId,
        relative_path: &str,
    ) -> Result<Option<AssetLocationRecord>, EngineError> {
        self.lock()
            .query_row(
                "SELECT content_hash, location_id, relative_path, last_verified_at,
                        last_modified_at, observed_size_bytes, sync_state
                 FROM asset_locations WHERE location_id = ?1 AND relative_path = ?2
                 ORDER BY (sync_state = 'missing'), last_verified_at DESC
                 LIMIT 1",
                params![location_id.to_string(), relative_path],
                record_from_row,
            )
            .optional()
            .map_err(EngineError::index)?
            .transpose()
    }

    pub fn records_for_asset(
        &self,
        content_hash: &str,
    ) -> Result<Vec<AssetLocationRecord>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT content_hash, location_id, relative_path, last_verified_at,
                        last_modified_at, observed_size_bytes, sync_state
                 FROM asset_locations WHERE content_hash = ?1
                 ORDER BY location_id, relative_path",
            )
            .map_err(EngineError::index)?;
        let rows = stmt
            .query_map(params![content_hash], record_from_row)
            .map_err(EngineError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::index)?;
        rows.into_iter().collect()
    }

    pub fn records_for_location(
        &self,
        location_id: LocationId,
    ) -> Result<Vec<AssetLocationRecord>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT content_hash, location_id, relative_path, last_verified_at,
                        last_modified_at, observed_size_bytes, sync_state
                 FROM asset_locations WHERE location_id = ?1
                 ORDER BY relative_path",
            )
            .map_err(EngineError::index)?;
        let rows = stmt
            .query_map(params![location_id.to_string()], record_from_row)
            .map_err(EngineError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::index)?;
        rows.into_iter().collect()
    }

    /// Mark every record in a location whose path was NOT observed in the
    /// current scan as missing. Returns the number of records transitioned.
    pub fn mark_missing_except(
        &self,
        location_id: LocationId,
        seen_paths: &HashSet<String>,
    ) -> Result<usize, EngineError> {
        let existing = self.records_for_location(location_id)?;
        let mut transitioned = 0;
        for record in existing {
            if record.sync_state == SyncState::Missing {
                continue;
            }
            if !seen_paths.contains(&record.relative_path) {
                self.set_record_state(
                    &record.content_hash,
                    location_id,
                    &record.relative_path,
                    SyncState::Missing,
                )?;
                debug!(
                    content_hash = %record.content_hash,
                    path = %record.relative_path,
                    "record marked missing"
                );
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    pub fn set_record_state(
        &self,
        content_hash: &str,
        location_id: LocationId,
        relative_path: &str,
        state: SyncState,
    ) -> Result<(), EngineError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE asset_locations SET sync_state = ?4, last_verified_at = ?5
                 WHERE content_hash = ?1 AND location_id = ?2 AND relative_path = ?3",
                params![
                    content_hash,
                    location_id.to_string(),
                    relative_path,
                    state.as_str(),
                    ts(Utc::now()),
                ],
            )
            .map_err(EngineError::index)?;
        if changed == 0 {
            return Err(EngineError::not_found("location record", content_hash));
        }
        Ok(())
    }

    /// Explicitly delete a record. Records are otherwise never deleted, only
    /// marked missing.
    pub fn prune_record(
        &self,
        content_hash: &str,
        location_id: LocationId,
        relative_path: &str,
    ) -> Result<(), EngineError> {
        self.lock()
            .execute(
                "DELETE FROM asset_locations
                 WHERE content_hash = ?1 AND location_id = ?2 AND relative_path = ?3",
                params![content_hash, location_id.to_string(), relative_path],
            )
            .map_err(EngineError::index)?;
        Ok(())
    }

    // ── Conflicts ──

    /// Record a new open conflict. At most one open conflict may exist per
    /// hash; a second insert is a no-op returning the existing one.
    pub fn open_conflict(&self, conflict: &ConflictRecord) -> Result<ConflictRecord, EngineError> {
        if let Some(existing) = self.get_open_conflict(&conflict.content_hash)? {
            return Ok(existing);
        }
        let records = serde_json::to_string(&conflict.records).map_err(EngineError::index)?;
        self.lock()
            .execute(
                "INSERT INTO conflicts (content_hash, records, strategy, chosen_location_id, detected_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conflict.content_hash,
                    records,
                    conflict.strategy.map(|s| s.as_str()),
                    conflict.chosen_location_id.map(|id| id.to_string()),
                    ts(conflict.detected_at),
                    conflict.resolved_at.map(ts),
                ],
            )
            .map_err(EngineError::index)?;
        Ok(conflict.clone())
    }

    pub fn get_open_conflict(
        &self,
        content_hash: &str,
    ) -> Result<Option<ConflictRecord>, EngineError> {
        self.lock()
            .query_row(
                "SELECT content_hash, records, strategy, chosen_location_id, detected_at, resolved_at
                 FROM conflicts WHERE content_hash = ?1 AND resolved_at IS NULL",
                params![content_hash],
                conflict_from_row,
            )
            .optional()
            .map_err(EngineError::index)?
            .transpose()
    }

    pub fn list_conflicts(&self, open_only: bool) -> Result<Vec<ConflictRecord>, EngineError> {
        let sql = if open_only {
            "SELECT content_hash, records, strategy, chosen_location_id, detected_at, resolved_at
             FROM conflicts WHERE resolved_at IS NULL ORDER BY detected_at"
        } else {
            "SELECT content_hash, records, strategy, chosen_location_id, detected_at, resolved_at
             FROM conflicts ORDER BY detected_at"
        };
        let conn = self.lock();
        let mut stmt = conn.prepare(sql).map_err(EngineError::index)?;
        let rows = stmt
            .query_map([], conflict_from_row)
            .map_err(EngineError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::index)?;
        rows.into_iter().collect()
    }

    pub fn set_conflict_strategy(
        &self,
        content_hash: &str,
        strategy: ResolutionStrategy,
    ) -> Result<(), EngineError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE conflicts SET strategy = ?2
                 WHERE content_hash = ?1 AND resolved_at IS NULL",
                params![content_hash, strategy.as_str()],
            )
            .map_err(EngineError::index)?;
        if changed == 0 {
            return Err(EngineError::not_found("open conflict", content_hash));
        }
        Ok(())
    }

    /// Close the open conflict for a hash, recording the winning location.
    /// Resolved conflicts are kept as an audit trail.
    pub fn mark_resolved(
        &self,
        content_hash: &str,
        strategy: ResolutionStrategy,
        chosen: LocationId,
    ) -> Result<(), EngineError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE conflicts SET strategy = ?2, chosen_location_id = ?3, resolved_at = ?4
                 WHERE content_hash = ?1 AND resolved_at IS NULL",
                params![
                    content_hash,
                    strategy.as_str(),
                    chosen.to_string(),
                    ts(Utc::now()),
                ],
            )
            .map_err(EngineError::index)?;
        if changed == 0 {
            return Err(EngineError::not_found("open conflict", content_hash));
        }
        Ok(())
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(EngineError::index)
}

// Row mappers return nested Results: the outer rusqlite::Result for column
// access, the inner for field parsing done after the row is out of SQLite.

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Asset, EngineError>> {
    let created_at: String = row.get(3)?;
    let tags: String = row.get(4)?;
    let size: i64 = row.get(1)?;
    let content_hash: String = row.get(0)?;
    let media_type: Option<String> = row.get(2)?;
    let quality: Option<f64> = row.get(5)?;
    Ok((|| {
        Ok(Asset {
            content_hash,
            size_bytes: size as u64,
            media_type,
            created_at: parse_ts(&created_at)?,
            tags: serde_json::from_str(&tags).map_err(EngineError::index)?,
            quality,
        })
    })())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<AssetLocationRecord, EngineError>> {
    let content_hash: String = row.get(0)?;
    let location_id: String = row.get(1)?;
    let relative_path: String = row.get(2)?;
    let last_verified_at: String = row.get(3)?;
    let last_modified_at: String = row.get(4)?;
    let observed_size: i64 = row.get(5)?;
    let sync_state: String = row.get(6)?;
    Ok((|| {
        Ok(AssetLocationRecord {
            content_hash,
            location_id: location_id.parse().map_err(EngineError::index)?,
            relative_path,
            last_verified_at: parse_ts(&last_verified_at)?,
            last_modified_at: parse_ts(&last_modified_at)?,
            observed_size_bytes: observed_size as u64,
            sync_state: sync_state.parse().map_err(EngineError::index)?,
        })
    })())
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ConflictRecord, EngineError>> {
    let content_hash: String = row.get(0)?;
    let records: String = row.get(1)?;
    let strategy: Option<String> = row.get(2)?;
    let chosen: Option<String> = row.get(3)?;
    let detected_at: String = row.get(4)?;
    let resolved_at: Option<String> = row.get(5)?;
    Ok((|| {
        Ok(ConflictRecord {
            content_hash,
            records: serde_json::from_str(&records).map_err(EngineError::index)?,
            strategy: strategy
                .map(|s| s.parse().map_err(EngineError::index))
                .transpose()?,
            chosen_location_id: chosen
                .map(|s| s.parse().map_err(EngineError::index))
                .transpose()?,
            detected_at: parse_ts(&detected_at)?,
            resolved_at: resolved_at.map(|s| parse_ts(&s)).transpose()?,
        })
    })())
}
