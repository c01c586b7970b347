// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use super::{CredentialsManager, ReconcileStats, SecretStateMetrics};

/// Runs a sweep at start and then every `interval`.
pub struct CredentialsJob {
    manager: Arc<CredentialsManager>,
    interval: Duration,
    reconciliation_delay: Duration,
    metrics: Option<SecretStateMetrics>,
    shutdown: Arc<Notify>,
}

impl CredentialsJob {
    pub fn new(manager: Arc<CredentialsManager>, interval: Duration, reconciliation_delay: Duration) -> Self {
        Self {
            manager,
            interval,
            reconciliation_delay,
            metrics: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: SecretStateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// One scheduled sweep. Errors are logged.
    pub async fn tick(&self) -> Option<ReconcileStats> {
        info!("Runtime reconciler: scheduled call started");
        match self
            .manager
            .reconcile_all(self.reconciliation_delay, self.metrics.as_ref())
            .await
        {
            Ok(stats) => {
                info!("Runtime reconciler: scheduled call finished with success");
                Some(stats)
            }
            Err(e) => {
                error!(error = %e, "Runtime reconciler: scheduled call finished with error");
                None
            }
        }
    }

    /// Run sweeps until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            reconciliation_delay_ms = self.reconciliation_delay.as_millis() as u64,
            metrics = self.metrics.is_some(),
            "Runtime reconciler job started"
        );

        loop {
            self.tick().await;
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Runtime reconciler job received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Runtime reconciler job stopped");
    }
}
