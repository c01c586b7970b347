// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! keb-environments-cleanup - removes stale shoots on development landscapes
//!
//! A single pass; scheduling is left to the surrounding cron job.

use std::sync::Arc;

use tracing::{error, info, warn};

use keb_clients::broker::HttpBrokerClient;
use keb_clients::cluster::KubeClusterClient;
use keb_process::config::EnvironmentsCleanupConfig;
use keb_process::environments_cleanup::{CleanupSettings, EnvironmentsCleanup};
use keb_process::{logging, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = EnvironmentsCleanupConfig::from_env()?;
    logging::init(&config.log);
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let settings = CleanupSettings::from(&config);
    info!(
        gardener_namespace = %settings.gardener_namespace,
        label_selector = %settings.label_selector,
        max_age_hours = settings.max_age.as_secs() / 3600,
        "Starting environments cleanup"
    );

    let store = storage::connect(&config.database).await?;
    let kcp = Arc::new(KubeClusterClient::infer(config.cluster_operation_timeout).await?);
    let gardener = match &config.gardener_kubeconfig_path {
        Some(path) => Arc::new(
            KubeClusterClient::from_kubeconfig_path(path, config.cluster_operation_timeout).await?,
        ),
        None => kcp.clone(),
    };
    let broker = Arc::new(HttpBrokerClient::new(config.broker.clone())?);

    let cleanup = EnvironmentsCleanup::new(gardener, kcp, broker, store, settings);
    match cleanup.run().await {
        Ok(report) => {
            info!(
                instances_deprovisioned = report.instances_deprovisioned,
                runtimes_deleted = report.runtimes_deleted,
                shoots_deleted = report.shoots_deleted,
                "Environments cleanup succeeded"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Environments cleanup failed");
            Err(e.into())
        }
    }
}
