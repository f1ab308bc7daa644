use std::path::PathBuf;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stowage_engine::config::EngineConfig;
use stowage_engine::migration::ExecuteOptions;
use stowage_engine::scanner::ScanOptions;
use stowage_engine::Engine;

const USAGE: &str = "usage: stowage <config.toml> <scan|plan|migrate|conflicts|resolve HASH STRATEGY>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path: PathBuf = args.next().context(USAGE)?.into();
    let command = args.next().unwrap_or_else(|| "plan".to_string());

    let config = EngineConfig::load(&config_path)?;
    let engine = Engine::new(&config)?;
    info!(locations = engine.registry.list(None).len(), "engine ready");

    match command.as_str() {
        "scan" => {
            let report = engine.scanner.discover_all(&ScanOptions::default()).await?;
            for (id, scan) in &report.scanned {
                info!(
                    location = %id,
                    added = scan.added,
                    updated = scan.updated,
                    unchanged = scan.unchanged,
                    missing = scan.missing,
                    failed = scan.failed.len(),
                    "location scanned"
                );
            }
            for (id, error) in &report.failed {
                info!(location = %id, error = %error, "location scan failed");
            }
        }
        "plan" => {
            let plan = engine.migrator.plan()?;
            engine
                .migrator
                .execute(
                    &plan,
                    &ExecuteOptions {
                        dry_run: true,
                        ..Default::default()
                    },
                )
                .await?;
            for (hash, reason) in &plan.unplaceable {
                info!(content_hash = %hash, reason = %reason, "unplaceable");
            }
            for hash in &plan.conflicted {
                info!(content_hash = %hash, "skipped: open conflict");
            }
        }
        "migrate" => {
            let plan = engine.migrator.plan()?;
            let report = engine
                .migrator
                .execute(&plan, &ExecuteOptions::default())
                .await?;
            info!(
                completed = report.completed(),
                failed = report.failed(),
                "migration finished"
            );
        }
        "conflicts" => {
            engine.sync.detect_conflicts()?;
            for conflict in engine.sync.list_conflicts(true)? {
                info!(
                    content_hash = %conflict.content_hash,
                    copies = conflict.records.len(),
                    strategy = ?conflict.strategy,
                    "open conflict"
                );
            }
        }
        "resolve" => {
            let hash = args.next().context(USAGE)?;
            let strategy = args.next().context(USAGE)?;
            let strategy = strategy
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let outcome = engine.sync.resolve(&hash, strategy)?;
            info!(
                content_hash = %outcome.content_hash,
                chosen = ?outcome.chosen_location_id,
                resolved = outcome.resolved_at.is_some(),
                "resolution applied"
            );
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}
