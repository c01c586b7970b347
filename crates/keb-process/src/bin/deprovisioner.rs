// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! keb-deprovisioner - runs deprovisioning operations through the pipeline
//!
//! Polls storage for not-finished deprovisioning operations and executes
//! them until a shutdown signal arrives.

use std::sync::Arc;

use tracing::{info, warn};

use keb_clients::cluster::{ClusterClient, KubeClusterClient, KubeconfigAccessProvider};
use keb_clients::edp::HttpEdpClient;
use keb_clients::hyperscaler::GardenerAccountPool;
use keb_clients::provisioner::{HttpProvisionerClient, ProvisionerClient};
use keb_process::config::{DeprovisioningConfig, gardener_namespace};
use keb_process::deprovisioning::{
    Collaborators, DeprovisioningWorker, PipelineConfig, WorkerConfig, build_pipeline,
};
use keb_process::plan_config::ConfigMapPlanConfig;
use keb_process::{logging, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = DeprovisioningConfig::from_env()?;
    logging::init(&config.log);
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        workers = config.workers,
        poll_interval_secs = config.poll_interval.as_secs(),
        operation_timeout_secs = config.operation_timeout.as_secs(),
        provisioner = !config.provisioner_url.is_empty(),
        "Starting deprovisioner"
    );

    let store = storage::connect(&config.database).await?;
    let kcp: Arc<dyn ClusterClient> =
        Arc::new(KubeClusterClient::infer(config.cluster_operation_timeout).await?);
    let gardener: Arc<dyn ClusterClient> = match &config.gardener_kubeconfig_path {
        Some(path) => Arc::new(
            KubeClusterClient::from_kubeconfig_path(path, config.cluster_operation_timeout).await?,
        ),
        None => kcp.clone(),
    };
    let provisioner: Option<Arc<dyn ProvisionerClient>> = if config.provisioner_url.is_empty() {
        None
    } else {
        Some(Arc::new(HttpProvisionerClient::new(
            config.provisioner_url.clone(),
            config.cluster_operation_timeout,
        )?))
    };

    let collaborators = Collaborators {
        storage: store.clone(),
        kcp: kcp.clone(),
        cluster_access: Arc::new(KubeconfigAccessProvider::new(
            kcp.clone(),
            config.cluster_operation_timeout,
        )),
        plan_config: Arc::new(ConfigMapPlanConfig::new(
            kcp,
            config.runtime_configuration_configmap.clone(),
        )),
        provisioner,
        edp: Arc::new(HttpEdpClient::new(config.edp.clone())?),
        accounts: Arc::new(GardenerAccountPool::new(
            gardener,
            gardener_namespace(&config.gardener_project),
        )),
    };
    let pipeline = build_pipeline(collaborators, &PipelineConfig::from(&config))?;

    let worker = DeprovisioningWorker::new(
        store,
        pipeline,
        WorkerConfig {
            workers: config.workers,
            poll_interval: config.poll_interval,
        },
    );
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.notify_one();
    handle.await?;

    info!("Deprovisioner shut down");
    Ok(())
}
