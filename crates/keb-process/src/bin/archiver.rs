// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! keb-archiver - archives operation logs of removed instances
//!
//! Runs archival batches until the backlog is drained, then exits.

use tracing::{info, warn};

use keb_process::archive::{ArchiveService, ArchiveSettings, run_job};
use keb_process::config::ArchiverConfig;
use keb_process::{logging, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = ArchiverConfig::from_env()?;
    logging::init(&config.log);
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        dry_run = config.dry_run,
        perform_deletion = config.perform_deletion,
        batch_size = config.batch_size,
        "Starting archiver"
    );

    let store = storage::connect(&config.database).await?;
    let service = ArchiveService::new(store.clone(), ArchiveSettings::from(&config));
    let report = run_job(&service, store.as_ref()).await?;

    info!(
        instances_processed = report.instances_processed,
        operations_deleted = report.operations_deleted,
        instances_failed = report.instances_failed,
        "Archiver finished"
    );
    Ok(())
}
