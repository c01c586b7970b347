// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation of the BTP manager secret in tenant clusters.
//!
//! The broker's database holds the authoritative service-manager credentials
//! of every instance. A sweep walks the reconcilable instances one at a time
//! and makes the `kyma-system/sap-btp-manager` secret in each tenant cluster
//! match them. Users can take over the secret by labelling it with
//! `operator.kyma-project.io/skip-reconciliation=true`.

mod job;
mod metrics;
mod secret;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use keb_clients::cluster::{
    ClusterAccessError, ClusterAccessProvider, ClusterClient, ClusterError, ResourceKind,
    from_dynamic, label,
};
use keb_core::model::Instance;
use keb_core::persistence::InstanceFilter;
use keb_core::{ErrorKind, Persistence, StorageError};
use thiserror::Error;
use tracing::{error, info, warn};

pub use job::CredentialsJob;
pub use metrics::{METER_NAME, SECRET_STATE_GAUGE, SecretStateMetrics};
pub use secret::{
    BTP_MANAGER_SECRET_NAME, BTP_MANAGER_SECRET_NAMESPACE, SECRET_KEYS, SKIP_RECONCILIATION_LABEL,
    broker_labels, diff_keys, is_skipped, prepare_secret,
};

/// Namespace of the Kyma resources in the control plane.
const KCP_NAMESPACE: &str = "kcp-system";

/// Label of a Kyma resource naming its instance.
pub const INSTANCE_ID_LABEL: &str = "kyma-project.io/instance-id";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("{0} not set")]
    MissingData(&'static str),

    #[error("while getting a client for the tenant cluster: {0}")]
    ClusterAccess(#[from] ClusterAccessError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cluster operations did not finish within {0:?}")]
    Timeout(Duration),

    #[error("kyma {0} has no {INSTANCE_ID_LABEL} label")]
    MissingInstanceLabel(String),
}

impl CredentialsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CredentialsError::MissingData(_) | CredentialsError::MissingInstanceLabel(_) => {
                ErrorKind::Permanent
            }
            CredentialsError::ClusterAccess(e) => e.kind(),
            CredentialsError::Cluster(e) => e.kind(),
            CredentialsError::Storage(e) => e.kind(),
            CredentialsError::Timeout(_) => ErrorKind::Transient,
        }
    }
}

/// What one reconciliation did to the secret. In dry-run mode `Created`
/// and `Updated` report what would have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
}

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub instance_cnt: usize,
    pub skipped_cnt: usize,
    pub not_changed_cnt: usize,
    /// Created or updated secrets.
    pub updated_cnt: usize,
    pub update_errors_cnt: usize,
}

pub struct CredentialsManager {
    storage: Arc<dyn Persistence>,
    kcp: Arc<dyn ClusterClient>,
    clusters: Arc<dyn ClusterAccessProvider>,
    dry_run: bool,
    operation_timeout: Duration,
}

impl CredentialsManager {
    pub fn new(
        storage: Arc<dyn Persistence>,
        kcp: Arc<dyn ClusterClient>,
        clusters: Arc<dyn ClusterAccessProvider>,
    ) -> Self {
        Self {
            storage,
            kcp,
            clusters,
            dry_run: false,
            operation_timeout: Duration::from_secs(30),
        }
    }

    /// Log changes instead of writing them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Bound on all cluster calls of one instance.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Instances whose secret can be reconciled.
    pub async fn reconcile_candidates(&self) -> Result<Vec<Instance>, CredentialsError> {
        let all = self.storage.list_instances(&InstanceFilter::default()).await?;
        info!(total = all.len(), "Total number of instances in db");

        let total = all.len();
        let candidates: Vec<Instance> = all
            .into_iter()
            .filter(|instance| {
                if !instance.reconcilable {
                    info!(
                        instance_id = %instance.instance_id,
                        "Skipping instance, not reconcilable (no runtime id, deprovisioned or operation in progress)"
                    );
                    return false;
                }
                if instance.parameters.sm_credentials().is_none()
                    || instance.instance_details.sm_cluster_id.is_empty()
                {
                    warn!(
                        instance_id = %instance.instance_id,
                        "Skipping instance, no credentials attached"
                    );
                    return false;
                }
                true
            })
            .collect();
        info!(total, candidates = candidates.len(), "Selected reconciliation candidates");
        Ok(candidates)
    }

    /// One sweep over all candidates, pausing `delay` before each.
    pub async fn reconcile_all(
        &self,
        delay: Duration,
        metrics: Option<&SecretStateMetrics>,
    ) -> Result<ReconcileStats, CredentialsError> {
        let instances = self.reconcile_candidates().await?;
        info!(count = instances.len(), "Processing instances as candidates");

        let mut stats = ReconcileStats {
            instance_cnt: instances.len(),
            ..Default::default()
        };
        for instance in &instances {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match self.reconcile_secret_for_instance(instance).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(instance_id = %instance.instance_id, error = %e, "Reconciliation failed");
                    stats.update_errors_cnt += 1;
                    continue;
                }
            };
            if let Some(metrics) = metrics {
                metrics.record(&instance.runtime_id, outcome == SecretOutcome::Skipped);
            }
            match outcome {
                SecretOutcome::Skipped => stats.skipped_cnt += 1,
                SecretOutcome::Unchanged => stats.not_changed_cnt += 1,
                SecretOutcome::Created | SecretOutcome::Updated => stats.updated_cnt += 1,
            }
        }

        info!(
            total = stats.instance_cnt,
            skipped = stats.skipped_cnt,
            unchanged = stats.not_changed_cnt,
            updated = stats.updated_cnt,
            errors = stats.update_errors_cnt,
            "Runtime reconciler summary"
        );
        Ok(stats)
    }

    /// Bring the secret of one instance in line with the database.
    pub async fn reconcile_secret_for_instance(
        &self,
        instance: &Instance,
    ) -> Result<SecretOutcome, CredentialsError> {
        info!(instance_id = %instance.instance_id, "Reconciliation of btp-manager secret started");
        let desired = prepare_secret(
            instance.parameters.sm_credentials(),
            &instance.instance_details.sm_cluster_id,
        )?;

        tokio::time::timeout(self.operation_timeout, self.converge(instance, &desired))
            .await
            .map_err(|_| CredentialsError::Timeout(self.operation_timeout))?
    }

    async fn converge(
        &self,
        instance: &Instance,
        desired: &Secret,
    ) -> Result<SecretOutcome, CredentialsError> {
        let instance_id = instance.instance_id.as_str();
        let client = self.clusters.client_for(&instance.runtime_id).await?;

        let current = match client
            .get(
                &ResourceKind::SECRET,
                Some(BTP_MANAGER_SECRET_NAMESPACE),
                BTP_MANAGER_SECRET_NAME,
            )
            .await
        {
            Ok(obj) => from_dynamic::<Secret>(&obj)?,
            Err(e) if e.is_not_found() => {
                info!(instance_id, "Secret not found on cluster");
                if self.dry_run {
                    info!(instance_id, "[dry-run] Secret would be re-created");
                } else {
                    secret::create_secret(client.as_ref(), desired).await?;
                    info!(instance_id, "Secret re-created");
                }
                return Ok(SecretOutcome::Created);
            }
            Err(e) => return Err(e.into()),
        };

        if is_skipped(&current) {
            info!(instance_id, "Skipping reconciliation of the secret");
            return Ok(SecretOutcome::Skipped);
        }

        let differing = diff_keys(&current, desired);
        if differing.is_empty() {
            info!(instance_id, "Secret on cluster matches the database");
            return Ok(SecretOutcome::Unchanged);
        }

        info!(
            instance_id,
            keys = %differing.join(","),
            "Secret on cluster does not match the database"
        );
        if self.dry_run {
            info!(instance_id, "[dry-run] Secret would be updated");
        } else {
            secret::update_secret(client.as_ref(), current, desired).await?;
        }
        Ok(SecretOutcome::Updated)
    }

    /// Instance owning a Kyma resource of the control plane.
    pub async fn match_instance(&self, kyma_name: &str) -> Result<Instance, CredentialsError> {
        let kyma = self
            .kcp
            .get(&ResourceKind::KYMA, Some(KCP_NAMESPACE), kyma_name)
            .await
            .inspect_err(|e| error!(kyma = kyma_name, error = %e, "Unable to get the Kyma resource"))?;
        let instance_id = label(&kyma, INSTANCE_ID_LABEL)
            .ok_or_else(|| CredentialsError::MissingInstanceLabel(kyma_name.to_string()))?;
        info!(kyma = kyma_name, instance_id, "Found instance id for Kyma");
        Ok(self.storage.get_instance(instance_id).await?)
    }

    /// Reconcile the secret of the instance behind a Kyma resource.
    pub async fn reconcile_for_kyma(&self, kyma_name: &str) -> Result<SecretOutcome, CredentialsError> {
        let instance = self.match_instance(kyma_name).await?;
        self.reconcile_secret_for_instance(&instance).await
    }
}
