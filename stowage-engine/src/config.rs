use std::path::{Path, PathBuf};

use serde::Deserialize;

use stowage_core::model::{LocationKind, LocationStatus, PlacementRule};
use stowage_core::EngineError;

/// Engine configuration, loaded from a TOML file at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the SQLite asset index.
    pub index_path: PathBuf,
    /// Allowed drift in `last_modified_at` between copies before the sync
    /// tracker treats them as conflicting.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_tolerance_secs: i64,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "locations")]
    pub locations: Vec<LocationDeclaration>,
}

fn default_clock_skew_secs() -> i64 {
    5
}

/// Per-backend-kind concurrency and retry tuning. Defaults are conservative
/// to respect cloud-provider rate limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "KindLimits::local_default")]
    pub local: KindLimits,
    #[serde(default = "KindLimits::remote_default")]
    pub s3: KindLimits,
    #[serde(default = "KindLimits::remote_default")]
    pub gcs: KindLimits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindLimits {
    /// Simultaneous backend calls per location of this kind.
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub op_timeout_secs: u64,
}

impl KindLimits {
    fn local_default() -> Self {
        Self {
            max_concurrent: 8,
            max_attempts: 2,
            op_timeout_secs: 30,
        }
    }

    fn remote_default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts: 4,
            op_timeout_secs: 120,
        }
    }
}

impl Limits {
    pub fn for_kind(&self, kind: LocationKind) -> &KindLimits {
        match kind {
            LocationKind::Local => &self.local,
            LocationKind::S3 => &self.s3,
            LocationKind::Gcs => &self.gcs,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            local: KindLimits::local_default(),
            s3: KindLimits::remote_default(),
            gcs: KindLimits::remote_default(),
        }
    }
}

/// Declarative storage location definition, imported idempotently into the
/// registry at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationDeclaration {
    pub name: String,
    pub kind: LocationKind,
    pub root: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_status")]
    pub status: LocationStatus,
    #[serde(default)]
    pub rules: Vec<PlacementRule>,
    #[serde(default)]
    pub credentials: Option<CredentialConfig>,
}

fn default_status() -> LocationStatus {
    LocationStatus::Active
}

/// Credential material for object-store backends. All fields optional; the
/// engine falls back to ambient environment credentials and is otherwise
/// agnostic to how they are sourced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// Bearer token for GCS.
    pub token: Option<String>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for decl in &self.locations {
            if decl.name.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "location name must not be empty".to_string(),
                ));
            }
            if decl.root.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "location '{}' has an empty root",
                    decl.name
                )));
            }
            if decl.kind == LocationKind::Local && !Path::new(&decl.root).is_absolute() {
                return Err(EngineError::InvalidConfig(format!(
                    "local location '{}' root must be absolute: {}",
                    decl.name, decl.root
                )));
            }
            for (i, rule) in decl.rules.iter().enumerate() {
                validate_rule(&decl.name, i, rule)?;
            }
        }
        if self.clock_skew_tolerance_secs < 0 {
            return Err(EngineError::InvalidConfig(
                "clock_skew_tolerance_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_rule(location: &str, index: usize, rule: &PlacementRule) -> Result<(), EngineError> {
    let bad = |what: &str| {
        Err(EngineError::InvalidConfig(format!(
            "location '{location}' rule {}: {what}",
            index + 1
        )))
    };
    if let (Some(min), Some(max)) = (rule.min_age_days, rule.max_age_days) {
        if min > max {
            return bad("min_age_days exceeds max_age_days");
        }
    }
    if let (Some(min), Some(max)) = (rule.min_size_bytes, rule.max_size_bytes) {
        if min > max {
            return bad("min_size_bytes exceeds max_size_bytes");
        }
    }
    if let (Some(min), Some(max)) = (rule.min_quality, rule.max_quality) {
        if min > max {
            return bad("min_quality exceeds max_quality");
        }
    }
    Ok(())
}
