// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removes service bindings and service instances from the tenant cluster.
//!
//! Suspension keeps the cluster but must free the service-broker objects the
//! tenant created. Deletion is requested for every namespace; the step is
//! requeued while objects remain. When the retry window is used up the
//! finalizers are stripped so the operation cannot hang on them.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::cluster::{ClusterAccessProvider, ClusterClient, ClusterError, ResourceKind};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation};
use thiserror::Error;
use tracing::{error, info, warn};

use super::{ACCOUNT_CLEANUP_USER_AGENT, BTP_OPERATOR_CLEANUP_STEP, handle_error};
use crate::operation_manager::{OperationManager, StepResult};
use crate::staged_manager::Step;

const SERVICE_KINDS: [ResourceKind; 2] = [ResourceKind::SERVICE_BINDING, ResourceKind::SERVICE_INSTANCE];

#[derive(Debug, Error)]
enum CleanupError {
    #[error("waiting for resources to be deleted")]
    Waiting,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{}", .0.join("; "))]
    Several(Vec<String>),
}

pub struct BtpOperatorCleanupStep {
    manager: OperationManager,
    cluster_access: Arc<dyn ClusterAccessProvider>,
}

impl BtpOperatorCleanupStep {
    pub fn new(storage: Arc<dyn Persistence>, cluster_access: Arc<dyn ClusterAccessProvider>) -> Self {
        Self {
            manager: OperationManager::new(storage, BTP_OPERATOR_CLEANUP_STEP, ErrorComponent::Keb),
            cluster_access,
        }
    }

    /// Request deletion of every object of both kinds, in every namespace.
    ///
    /// Returns [`CleanupError::Waiting`] while objects still exist.
    async fn delete_service_resources(&self, client: &dyn ClusterClient) -> Result<(), CleanupError> {
        let namespaces = namespace_names(client).await?;
        let mut requeue = false;
        for kind in &SERVICE_KINDS {
            requeue |= delete_kind(client, kind, &namespaces).await;
        }
        if requeue {
            return Err(CleanupError::Waiting);
        }
        Ok(())
    }

    /// Account cleanup: delete everything once and strip finalizers right
    /// away, without waiting.
    async fn soft_delete(&self, client: &dyn ClusterClient) -> Result<(), CleanupError> {
        let namespaces = namespace_names(client).await?;
        let mut errors = Vec::new();
        for kind in &SERVICE_KINDS {
            if !crd_exists(client, kind).await? {
                info!(kind = %kind, "CRD not installed, skipping");
                continue;
            }
            for namespace in &namespaces {
                if let Err(e) = client.delete_collection(kind, namespace).await {
                    errors.push(e.to_string());
                }
            }
            errors.extend(remove_finalizers(client, kind, &namespaces).await);
        }
        if !errors.is_empty() {
            return Err(CleanupError::Several(errors));
        }
        Ok(())
    }

    async fn retry_on_error(
        &self,
        operation: Operation,
        client: &dyn ClusterClient,
        err: CleanupError,
        temporary: bool,
        message: &str,
    ) -> StepResult {
        let backoff = handle_error(BTP_OPERATOR_CLEANUP_STEP, &operation, &err, temporary, message);
        if backoff.is_zero() {
            attempt_to_remove_finalizers(client).await;
        }
        Ok((operation, backoff))
    }
}

#[async_trait::async_trait]
impl Step for BtpOperatorCleanupStep {
    fn name(&self) -> &str {
        BTP_OPERATOR_CLEANUP_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.runtime_id().is_empty() {
            info!("Runtime ID is empty, skipping");
            return Ok((operation, Duration::ZERO));
        }

        let client = match self.cluster_access.client_for(operation.runtime_id()).await {
            Ok(client) => client,
            Err(e) if e.is_kubeconfig_not_found() => {
                info!("Kubeconfig does not exist, skipping BTP operator cleanup");
                return Ok((operation, Duration::ZERO));
            }
            Err(e) => {
                warn!(error = %e, "Unable to get the tenant cluster client");
                let description = format!("failed to get kube client: {e}");
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        BTP_OPERATOR_CLEANUP_STEP,
                        &description,
                        Duration::from_secs(1),
                        Duration::from_secs(30),
                        Some(&e),
                    )
                    .await;
            }
        };

        if operation.user_agent == ACCOUNT_CLEANUP_USER_AGENT {
            info!("Executing soft delete cleanup for account cleanup");
            return match self.soft_delete(client.as_ref()).await {
                Ok(()) => Ok((operation, Duration::ZERO)),
                Err(e) => {
                    self.retry_on_error(operation, client.as_ref(), e, false, "failed to cleanup")
                        .await
                }
            };
        }

        match self.delete_service_resources(client.as_ref()).await {
            Ok(()) => Ok((operation, Duration::ZERO)),
            Err(e) => {
                self.retry_on_error(
                    operation,
                    client.as_ref(),
                    e,
                    true,
                    "could not delete bindings and service instances",
                )
                .await
            }
        }
    }
}

async fn namespace_names(client: &dyn ClusterClient) -> Result<Vec<String>, ClusterError> {
    Ok(client
        .list(&ResourceKind::NAMESPACE, None, None)
        .await?
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .collect())
}

async fn crd_exists(client: &dyn ClusterClient, kind: &ResourceKind) -> Result<bool, ClusterError> {
    match client.get(&ResourceKind::CRD, None, &kind.crd_name()).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() || e.is_no_match() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether the step must be requeued for `kind`.
async fn delete_kind(client: &dyn ClusterClient, kind: &ResourceKind, namespaces: &[String]) -> bool {
    let mut requeue = false;
    let mut remaining = 0;
    for namespace in namespaces {
        match client.list(kind, Some(namespace), None).await {
            Ok(objects) => remaining += objects.len(),
            // The CRD is gone, nothing left to delete.
            Err(e) if e.is_no_match() => return false,
            Err(e) => {
                error!(kind = %kind, namespace = %namespace, error = %e, "Failed listing resources");
                requeue = true;
            }
        }
    }
    if remaining == 0 {
        return requeue;
    }

    for namespace in namespaces {
        if let Err(e) = client.delete_collection(kind, namespace).await {
            error!(kind = %kind, namespace = %namespace, error = %e, "Failed deleting resources");
        }
    }
    true
}

/// Empty the finalizers of every object of `kind`; returns the failures.
async fn remove_finalizers(
    client: &dyn ClusterClient,
    kind: &ResourceKind,
    namespaces: &[String],
) -> Vec<String> {
    let mut errors = Vec::new();
    for namespace in namespaces {
        let objects = match client.list(kind, Some(namespace), None).await {
            Ok(objects) => objects,
            Err(e) => {
                errors.push(format!(
                    "failed listing resource {kind} in namespace {namespace}: {e}"
                ));
                continue;
            }
        };
        for mut obj in objects {
            obj.metadata.finalizers = Some(Vec::new());
            if let Err(e) = client.replace(kind, &obj).await {
                errors.push(format!(
                    "failed to remove finalizer for resource {kind} {namespace}/{}: {e}",
                    obj.metadata.name.as_deref().unwrap_or_default()
                ));
            }
        }
    }
    errors
}

async fn attempt_to_remove_finalizers(client: &dyn ClusterClient) {
    let namespaces = match namespace_names(client).await {
        Ok(namespaces) => namespaces,
        Err(e) => {
            error!(error = %e, "Failed to list namespaces to remove finalizers");
            return;
        }
    };
    for kind in &SERVICE_KINDS {
        let errors = remove_finalizers(client, kind, &namespaces).await;
        if !errors.is_empty() {
            error!(kind = %kind, errors = %errors.join("; "), "Failed to remove finalizers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures::{self, RUNTIME_ID};
    use keb_clients::cluster::{FakeCluster, FakeClusterAccessProvider};
    use keb_core::plans;

    async fn tenant_with_resources(finalizers: bool) -> (Arc<FakeClusterAccessProvider>, Arc<FakeCluster>) {
        let access = Arc::new(FakeClusterAccessProvider::new());
        let cluster = access.register(RUNTIME_ID).await;
        for ns in ["default", "team-a"] {
            cluster
                .insert(&ResourceKind::NAMESPACE, ResourceKind::NAMESPACE.object(None, ns))
                .await;
        }
        for kind in &SERVICE_KINDS {
            cluster.install(kind).await;
            for (ns, name) in [("default", "first"), ("team-a", "second")] {
                let mut obj = kind.object(Some(ns), name);
                if finalizers {
                    obj.metadata.finalizers = Some(vec!["services.cloud.sap.com/finalizer".to_string()]);
                }
                cluster.insert(kind, obj).await;
            }
        }
        (access, cluster)
    }

    fn suspension() -> Operation {
        let mut op = fixtures::operation(plans::TRIAL_PLAN_ID);
        op.temporary = true;
        op
    }

    #[tokio::test]
    async fn test_resources_are_deleted_then_step_completes() {
        let store = fixtures::store().await;
        let (access, cluster) = tenant_with_resources(false).await;
        let step = BtpOperatorCleanupStep::new(store, access);

        let (op, backoff) = step.run(suspension()).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(10));
        assert_eq!(cluster.count(&ResourceKind::SERVICE_BINDING).await, 0);
        assert_eq!(cluster.count(&ResourceKind::SERVICE_INSTANCE).await, 0);

        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_finalizers_are_stripped_after_retry_window() {
        let store = fixtures::store().await;
        let (access, cluster) = tenant_with_resources(true).await;
        let step = BtpOperatorCleanupStep::new(store, access);

        let mut op = suspension();
        op.created_at -= chrono::Duration::hours(1);
        let (_, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(cluster.count(&ResourceKind::SERVICE_BINDING).await, 0);
        assert_eq!(cluster.count(&ResourceKind::SERVICE_INSTANCE).await, 0);
    }

    #[tokio::test]
    async fn test_soft_delete_for_account_cleanup() {
        let store = fixtures::store().await;
        let (access, cluster) = tenant_with_resources(true).await;
        cluster.uninstall(&ResourceKind::SERVICE_INSTANCE).await;
        let step = BtpOperatorCleanupStep::new(store, access);

        let mut op = fixtures::operation(plans::AWS_PLAN_ID);
        op.user_agent = ACCOUNT_CLEANUP_USER_AGENT.to_string();
        let (_, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(cluster.count(&ResourceKind::SERVICE_BINDING).await, 0);
        // Instances without a served CRD are left alone.
        assert_eq!(cluster.count(&ResourceKind::SERVICE_INSTANCE).await, 2);
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_or_crds_skip() {
        let store = fixtures::store().await;
        let access = Arc::new(FakeClusterAccessProvider::new());
        let step = BtpOperatorCleanupStep::new(store, access.clone());

        let (_, backoff) = step.run(suspension()).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);

        access.register(RUNTIME_ID).await;
        let (_, backoff) = step.run(suspension()).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_retried() {
        let store = fixtures::store().await;
        let (access, cluster) = tenant_with_resources(false).await;
        cluster.set_unreachable(true).await;
        let step = BtpOperatorCleanupStep::new(store, access);

        let (_, backoff) = step.run(suspension()).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(10));
    }
}
