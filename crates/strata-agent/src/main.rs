//! Strata Agent - management API beside each database instance

use std::sync::Arc;

use clap::Parser;

use strata_agent::backup::BackupService;
use strata_agent::config::AgentConfig;
use strata_agent::dump::PgDumpAll;
use strata_agent::restore::{restore, ReadinessPolicy};
use strata_agent::server::{serve, AppState};
use strata_agent::sql::{DatabaseAdmin, Psql};
use strata_agent::storage::StorageRegistry;
use strata_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();

    init_telemetry(TelemetryConfig {
        service_name: "strata-agent".to_string(),
        json: !config.log_text,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!(listen = %config.listen, "Strata agent starting...");

    let connection = config.connection();
    let admin = DatabaseAdmin::new(
        Arc::new(Psql::new(connection.clone())),
        connection.database.clone(),
    );
    let storage = StorageRegistry::with_builtins(&config.filesystem_root);

    let restore_config = config
        .restore()
        .map_err(|e| anyhow::anyhow!("Invalid restore configuration: {}", e))?;
    if let Some(source) = restore_config {
        let outcome = restore(
            &source,
            &storage,
            &admin,
            &config.backup_dir,
            ReadinessPolicy::default(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Restore failed: {}", e))?;
        tracing::info!(?outcome, "Restore step finished");
    }

    let backups = BackupService::new(
        Arc::new(PgDumpAll::new(connection)),
        storage,
        config.backup_dir.clone(),
    );

    serve(config.listen, AppState { admin, backups })
        .await
        .map_err(|e| anyhow::anyhow!("Management API failed: {}", e))?;

    tracing::info!("Strata agent shutting down");
    Ok(())
}
