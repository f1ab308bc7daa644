//! Authoritative catalog of configured storage locations.
//!
//! An explicitly constructed instance shared by handle (`Arc`) across the
//! scanner, migrator and sync tracker; lifecycle is owned by the top-level
//! application, never by first use.

use std::sync::RwLock;

use chrono::Utc;
use tracing::info;

use stowage_core::model::{
    LocationId, LocationKind, LocationStatus, PlacementRule, StorageLocation,
};
use stowage_core::EngineError;

use crate::config::LocationDeclaration;

#[derive(Debug, Clone)]
pub struct NewLocation {
    pub name: String,
    pub kind: LocationKind,
    pub root: String,
    pub priority: i32,
    pub status: LocationStatus,
    pub rules: Vec<PlacementRule>,
}

/// Partial update; `None` fields are left untouched. The id, kind and root
/// of a location are immutable after registration.
#[derive(Debug, Clone, Default)]
pub struct LocationPatch {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub status: Option<LocationStatus>,
    pub rules: Option<Vec<PlacementRule>>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportReport {
    pub registered: usize,
    pub updated: usize,
}

#[derive(Debug, Default)]
pub struct StorageRegistry {
    // Vec keeps registration order, which breaks priority ties in placement.
    inner: RwLock<Vec<StorageLocation>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new location. Fails when `(kind, root)` already exists.
    pub fn register(&self, new: NewLocation) -> Result<LocationId, EngineError> {
        let mut locations = self.inner.write().expect("registry lock poisoned");
        let root = normalize_root(&new.root);
        if locations
            .iter()
            .any(|l| l.kind == new.kind && l.root == root)
        {
            return Err(EngineError::DuplicateLocation {
                kind: new.kind,
                root,
            });
        }
        let location = StorageLocation {
            id: LocationId::new(),
            name: new.name,
            kind: new.kind,
            root,
            priority: new.priority,
            status: new.status,
            rules: new.rules,
            registered_at: Utc::now(),
        };
        let id = location.id;
        info!(location_id = %id, name = %location.name, kind = %location.kind, "location registered");
        locations.push(location);
        Ok(id)
    }

    pub fn update(&self, id: LocationId, patch: LocationPatch) -> Result<(), EngineError> {
        let mut locations = self.inner.write().expect("registry lock poisoned");
        let location = locations
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| EngineError::not_found("location", id.to_string()))?;
        if let Some(name) = patch.name {
            location.name = name;
        }
        if let Some(priority) = patch.priority {
            location.priority = priority;
        }
        if let Some(status) = patch.status {
            location.status = status;
        }
        if let Some(rules) = patch.rules {
            location.rules = rules;
        }
        Ok(())
    }

    pub fn get(&self, id: LocationId) -> Result<StorageLocation, EngineError> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("location", id.to_string()))
    }

    /// All locations in registration order, optionally filtered by status.
    pub fn list(&self, status: Option<LocationStatus>) -> Vec<StorageLocation> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|l| status.map_or(true, |s| l.status == s))
            .cloned()
            .collect()
    }

    /// Remove a location. Requires explicit confirmation because asset
    /// location records may still reference it.
    pub fn remove(&self, id: LocationId, confirm: bool) -> Result<StorageLocation, EngineError> {
        if !confirm {
            return Err(EngineError::ConfirmationRequired(id.to_string()));
        }
        let mut locations = self.inner.write().expect("registry lock poisoned");
        let pos = locations
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| EngineError::not_found("location", id.to_string()))?;
        let removed = locations.remove(pos);
        info!(location_id = %id, name = %removed.name, "location removed");
        Ok(removed)
    }

    /// Idempotent config import: declarations matching an existing
    /// `(kind, root)` update that location in place, others register anew.
    /// Re-importing the same declarations never creates duplicates.
    pub fn import(&self, declarations: &[LocationDeclaration]) -> Result<ImportReport, EngineError> {
        let mut report = ImportReport::default();
        for decl in declarations {
            let existing = {
                let locations = self.inner.read().expect("registry lock poisoned");
                let root = normalize_root(&decl.root);
                locations
                    .iter()
                    .find(|l| l.kind == decl.kind && l.root == root)
                    .map(|l| l.id)
            };
            match existing {
                Some(id) => {
                    self.update(
                        id,
                        LocationPatch {
                            name: Some(decl.name.clone()),
                            priority: Some(decl.priority),
                            status: Some(decl.status),
                            rules: Some(decl.rules.clone()),
                        },
                    )?;
                    report.updated += 1;
                }
                None => {
                    self.register(NewLocation {
                        name: decl.name.clone(),
                        kind: decl.kind,
                        root: decl.root.clone(),
                        priority: decl.priority,
                        status: decl.status,
                        rules: decl.rules.clone(),
                    })?;
                    report.registered += 1;
                }
            }
        }
        Ok(report)
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_location(name: &str, kind: LocationKind, root: &str) -> NewLocation {
        NewLocation {
            name: name.to_string(),
            kind,
            root: root.to_string(),
            priority: 0,
            status: LocationStatus::Active,
            rules: vec![],
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = StorageRegistry::new();
        let id = registry
            .register(new_location("fast", LocationKind::Local, "/srv/fast"))
            .unwrap();
        let loc = registry.get(id).unwrap();
        assert_eq!(loc.name, "fast");
        assert_eq!(loc.root, "/srv/fast");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = StorageRegistry::new();
        registry
            .register(new_location("a", LocationKind::S3, "bucket-x"))
            .unwrap();
        // Trailing slash normalizes to the same root.
        let err = registry
            .register(new_location("b", LocationKind::S3, "bucket-x/"))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLocation { .. }));
        assert_eq!(registry.list(None).len(), 1);
    }

    #[test]
    fn test_same_root_different_kind_allowed() {
        let registry = StorageRegistry::new();
        registry
            .register(new_location("a", LocationKind::S3, "bucket-x"))
            .unwrap();
        registry
            .register(new_location("b", LocationKind::Gcs, "bucket-x"))
            .unwrap();
        assert_eq!(registry.list(None).len(), 2);
    }

    #[test]
    fn test_update_unknown_id() {
        let registry = StorageRegistry::new();
        let err = registry
            .update(LocationId::new(), LocationPatch::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn test_status_filter_and_order() {
        let registry = StorageRegistry::new();
        let a = registry
            .register(new_location("a", LocationKind::Local, "/srv/a"))
            .unwrap();
        let b = registry
            .register(new_location("b", LocationKind::Local, "/srv/b"))
            .unwrap();
        registry
            .update(
                a,
                LocationPatch {
                    status: Some(LocationStatus::Offline),
                    ..Default::default()
                },
            )
            .unwrap();

        let active = registry.list(Some(LocationStatus::Active));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);

        let all = registry.list(None);
        assert_eq!(all[0].id, a, "registration order preserved");
    }

    #[test]
    fn test_remove_requires_confirmation() {
        let registry = StorageRegistry::new();
        let id = registry
            .register(new_location("a", LocationKind::Local, "/srv/a"))
            .unwrap();
        assert!(matches!(
            registry.remove(id, false),
            Err(EngineError::ConfirmationRequired(_))
        ));
        registry.remove(id, true).unwrap();
        assert!(registry.list(None).is_empty());
    }

    #[test]
    fn test_import_is_idempotent() {
        let registry = StorageRegistry::new();
        let decls: Vec<LocationDeclaration> = toml::from_str::<toml::Value>(
            r#"
[[locations]]
name = "fast"
kind = "local"
root = "/srv/fast"
priority = 100

[[locations]]
name = "archive"
kind = "s3"
root = "media-archive"
priority = 50
"#,
        )
        .unwrap()
        .get("locations")
        .unwrap()
        .clone()
        .try_into()
        .unwrap();

        let first = registry.import(&decls).unwrap();
        assert_eq!(first.registered, 2);
        assert_eq!(first.updated, 0);

        let second = registry.import(&decls).unwrap();
        assert_eq!(second.registered, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(registry.list(None).len(), 2);
    }
}
