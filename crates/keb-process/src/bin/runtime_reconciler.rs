// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! keb-runtime-reconciler - keeps the BTP manager secret of every tenant
//! cluster in line with the broker's database

use std::sync::Arc;

use tracing::{info, warn};

use keb_clients::cluster::{KubeClusterClient, KubeconfigAccessProvider};
use keb_process::config::ReconcilerConfig;
use keb_process::credentials::{CredentialsJob, CredentialsManager, SecretStateMetrics};
use keb_process::{logging, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = ReconcilerConfig::from_env()?;
    logging::init(&config.log);
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    if !config.job_enabled {
        info!("Runtime reconciler job is disabled, exiting");
        return Ok(());
    }

    info!(
        dry_run = config.dry_run,
        interval_minutes = config.job_interval.as_secs() / 60,
        metrics = config.metrics_enabled,
        "Starting runtime reconciler"
    );

    let store = storage::connect(&config.database).await?;
    let kcp = Arc::new(KubeClusterClient::infer(config.cluster_operation_timeout).await?);
    let clusters = Arc::new(KubeconfigAccessProvider::new(
        kcp.clone(),
        config.cluster_operation_timeout,
    ));
    let manager = Arc::new(
        CredentialsManager::new(store, kcp, clusters)
            .dry_run(config.dry_run)
            .operation_timeout(config.cluster_operation_timeout),
    );

    let mut job = CredentialsJob::new(manager, config.job_interval, config.job_reconciliation_delay);
    if config.metrics_enabled {
        job = job.with_metrics(SecretStateMetrics::global());
    }
    let shutdown = job.shutdown_handle();
    let handle = tokio::spawn(async move { job.run().await });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.notify_one();
    handle.await?;

    info!("Runtime reconciler shut down");
    Ok(())
}
