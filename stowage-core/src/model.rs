use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Storage locations ──

/// Opaque identifier for a storage location. Generated on registration,
/// immutable for the lifetime of the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(Uuid);

impl LocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Local,
    S3,
    Gcs,
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocationKind::Local => "local",
            LocationKind::S3 => "s3",
            LocationKind::Gcs => "gcs",
        })
    }
}

/// Offline and archived locations are excluded from new placement decisions
/// but remain valid for lookups against existing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Active,
    Offline,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub id: LocationId,
    pub name: String,
    pub kind: LocationKind,
    /// Filesystem path for `local`, `bucket` or `bucket/prefix` for object stores.
    pub root: String,
    /// Higher priority wins when multiple locations qualify.
    pub priority: i32,
    pub status: LocationStatus,
    #[serde(default)]
    pub rules: Vec<PlacementRule>,
    pub registered_at: DateTime<Utc>,
}

impl StorageLocation {
    pub fn is_active(&self) -> bool {
        self.status == LocationStatus::Active
    }
}

/// Declarative predicate over asset attributes. All fields optional; a rule
/// matches an asset only if every populated constraint matches. A rule with
/// no fields set is an explicit catch-all.
///
/// Unknown keys are a deserialization error so misspelled constraints fail
/// at load time instead of silently matching nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlacementRule {
    pub min_age_days: Option<i64>,
    pub max_age_days: Option<i64>,
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
    /// MIME types ("image/png"), top-level types ("image") or subtypes ("png").
    pub allow_types: Option<Vec<String>>,
    pub deny_types: Option<Vec<String>>,
    pub require_tags: Option<BTreeSet<String>>,
    pub exclude_tags: Option<BTreeSet<String>>,
    pub min_quality: Option<f64>,
    pub max_quality: Option<f64>,
}

impl PlacementRule {
    pub fn is_catch_all(&self) -> bool {
        *self == Self::default()
    }

    /// Short human-readable description of the populated constraints,
    /// used when explaining placement decisions.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.min_age_days {
            parts.push(format!("min_age_days {v}"));
        }
        if let Some(v) = self.max_age_days {
            parts.push(format!("max_age_days {v}"));
        }
        if let Some(v) = self.min_size_bytes {
            parts.push(format!("min_size_bytes {v}"));
        }
        if let Some(v) = self.max_size_bytes {
            parts.push(format!("max_size_bytes {v}"));
        }
        if let Some(ref v) = self.allow_types {
            parts.push(format!("allow_types {}", v.join("|")));
        }
        if let Some(ref v) = self.deny_types {
            parts.push(format!("deny_types {}", v.join("|")));
        }
        if let Some(ref v) = self.require_tags {
            parts.push(format!(
                "require_tags {}",
                v.iter().cloned().collect::<Vec<_>>().join("|")
            ));
        }
        if let Some(ref v) = self.exclude_tags {
            parts.push(format!(
                "exclude_tags {}",
                v.iter().cloned().collect::<Vec<_>>().join("|")
            ));
        }
        if let Some(v) = self.min_quality {
            parts.push(format!("min_quality {v}"));
        }
        if let Some(v) = self.max_quality {
            parts.push(format!("max_quality {v}"));
        }
        if parts.is_empty() {
            "catch-all".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ── Assets ──

/// A content-addressed asset. Identity is the hash of the file bytes; one
/// asset exists per distinct hash no matter how many locations or filenames
/// reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub content_hash: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Time of first observation anywhere.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    PendingUpload,
    PendingUpdate,
    Conflict,
    Missing,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingUpload => "pending_upload",
            SyncState::PendingUpdate => "pending_update",
            SyncState::Conflict => "conflict",
            SyncState::Missing => "missing",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncState::Synced),
            "pending_upload" => Ok(SyncState::PendingUpload),
            "pending_update" => Ok(SyncState::PendingUpdate),
            "conflict" => Ok(SyncState::Conflict),
            "missing" => Ok(SyncState::Missing),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}

/// Join entity between an asset and a storage location. Created on first
/// observation, updated on every re-scan, marked missing when the path
/// disappears, and deleted only by explicit pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetLocationRecord {
    pub content_hash: String,
    pub location_id: LocationId,
    pub relative_path: String,
    pub last_verified_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub observed_size_bytes: u64,
    pub sync_state: SyncState,
}

// ── Migration ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    Copy,
    Move,
}

/// Transient plan item. Lives only for the duration of a planning/execution
/// cycle; never persisted beyond the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlanEntry {
    pub content_hash: String,
    pub source_location_id: LocationId,
    pub destination_location_id: LocationId,
    pub action: MigrationAction,
    /// Which rule(s) justified the relocation.
    pub reason: String,
}

// ── Conflicts ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Newest,
    Largest,
    Primary,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Newest => "newest",
            ResolutionStrategy::Largest => "largest",
            ResolutionStrategy::Primary => "primary",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(ResolutionStrategy::Newest),
            "largest" => Ok(ResolutionStrategy::Largest),
            "primary" => Ok(ResolutionStrategy::Primary),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// Divergent copies of the same content hash. Created by the sync tracker,
/// resolved (never deleted) once a strategy selects a canonical copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub content_hash: String,
    /// The competing location records, snapshotted at detection time.
    pub records: Vec<AssetLocationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_location_id: Option<LocationId>,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub content_hash: String,
    pub strategy: ResolutionStrategy,
    /// None when the strategy is `manual` and no external decision has been
    /// supplied yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_location_id: Option<LocationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}
