//! Multi-location asset storage and lifecycle engine.
//!
//! Tracks content-addressed assets across heterogeneous storage locations
//! (local directories, S3, GCS), evaluates declarative placement rules, and
//! keeps reality converging on the rules through scanning, planned
//! migration, and conflict resolution.

pub mod backend;
pub mod config;
pub mod index;
pub mod migration;
pub mod registry;
pub mod retry;
pub mod scanner;
pub mod sync;

use std::sync::Arc;

use stowage_core::model::LocationId;
use stowage_core::EngineError;

use backend::{AdapterFactory, DefaultAdapterFactory};
use config::EngineConfig;
use index::AssetIndex;
use migration::Migrator;
use registry::StorageRegistry;
use scanner::Scanner;
use sync::SyncTracker;

/// Progress reporting for long-running operations. Events are sent on an
/// unbounded channel; a dropped receiver is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Scan {
        location_id: LocationId,
        processed: usize,
        total: usize,
        current: String,
    },
    Migration {
        processed: usize,
        total: usize,
        current: String,
    },
}

/// Wires the registry, index and subsystems together from one config.
pub struct Engine {
    pub registry: Arc<StorageRegistry>,
    pub index: AssetIndex,
    pub scanner: Scanner,
    pub migrator: Migrator,
    pub sync: SyncTracker,
}

impl Engine {
    /// Open the index, import the declared locations, and build the
    /// subsystems with real backend adapters.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let index = AssetIndex::open(&config.index_path)?;
        let factory = Arc::new(DefaultAdapterFactory::from_config(config));
        Self::assemble(config, index, factory)
    }

    /// Same wiring with an injected index and adapter factory.
    pub fn assemble(
        config: &EngineConfig,
        index: AssetIndex,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Arc::new(StorageRegistry::new());
        registry.import(&config.locations)?;

        let scanner = Scanner::new(
            Arc::clone(&registry),
            index.clone(),
            Arc::clone(&factory),
            config.limits.clone(),
        );
        let migrator = Migrator::new(
            Arc::clone(&registry),
            index.clone(),
            factory,
            config.limits.clone(),
        );
        let sync = SyncTracker::new(
            Arc::clone(&registry),
            index.clone(),
            config.clock_skew_tolerance_secs,
        );

        Ok(Self {
            registry,
            index,
            scanner,
            migrator,
            sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::ExecuteOptions;
    use scanner::ScanOptions;

    fn config(fast: &std::path::Path, archive: &std::path::Path) -> EngineConfig {
        let toml_str = format!(
            r#"
index_path = "unused"

[[locations]]
name = "fast"
kind = "local"
root = "{}"
priority = 100

[[locations.rules]]
max_age_days = 30

[[locations]]
name = "archive"
kind = "local"
root = "{}"
priority = 50
"#,
            fast.display(),
            archive.display()
        );
        toml::from_str(&toml_str).unwrap()
    }

    #[tokio::test]
    async fn test_engine_scan_and_plan_end_to_end() {
        let fast = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("fresh.jpg"), b"fresh image").unwrap();

        let engine = Engine::assemble(
            &config(fast.path(), archive.path()),
            AssetIndex::open_in_memory().unwrap(),
            Arc::new(DefaultAdapterFactory::default()),
        )
        .unwrap();
        assert_eq!(engine.registry.list(None).len(), 2);

        let discovery = engine.scanner.discover_all(&ScanOptions::default()).await.unwrap();
        assert_eq!(discovery.scanned.len(), 2);
        assert_eq!(discovery.scanned[0].1.added, 1);

        // A freshly observed asset already sits where the rules want it.
        let plan = engine.migrator.plan().unwrap();
        assert!(plan.is_converged());

        let report = engine
            .migrator
            .execute(&plan, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report.completed(), 0);

        assert!(engine.sync.detect_conflicts().unwrap().is_empty());
    }
}
