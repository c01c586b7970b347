// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletion of the GardenerCluster custom resource.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::cluster::{ClusterClient, ResourceKind};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation};
use tracing::{info, warn};

use super::{
    CHECK_GARDENER_CLUSTER_DELETED_STEP, DELETE_GARDENER_CLUSTER_STEP, K8S_OPERATION_BACKOFF,
    K8S_OPERATION_TIMEOUT, KCP_NAMESPACE,
};
use crate::operation_manager::{OperationManager, StepResult};
use crate::staged_manager::Step;

fn resource_namespace(operation: &Operation) -> String {
    let namespace = &operation.instance_details.kyma_resource_namespace;
    if namespace.is_empty() {
        warn!("Namespace for Kyma resource not specified, using {KCP_NAMESPACE}");
        return KCP_NAMESPACE.to_string();
    }
    namespace.clone()
}

fn gardener_cluster_name(operation: &Operation) -> String {
    if !operation.instance_details.gardener_cluster_name.is_empty() {
        return operation.instance_details.gardener_cluster_name.clone();
    }
    operation.runtime_id().to_lowercase()
}

pub struct DeleteGardenerClusterStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    kcp: Arc<dyn ClusterClient>,
}

impl DeleteGardenerClusterStep {
    pub fn new(storage: Arc<dyn Persistence>, kcp: Arc<dyn ClusterClient>) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                DELETE_GARDENER_CLUSTER_STEP,
                ErrorComponent::InfrastructureManager,
            ),
            storage,
            kcp,
        }
    }
}

#[async_trait::async_trait]
impl Step for DeleteGardenerClusterStep {
    fn name(&self) -> &str {
        DELETE_GARDENER_CLUSTER_STEP
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let namespace = resource_namespace(&operation);
        let mut name = gardener_cluster_name(&operation);
        if name.is_empty() {
            info!("GardenerCluster name is empty, using the runtime id of the instance");
            let instance = match self.storage.get_instance(&operation.instance_id).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(error = %e, "Unable to get instance");
                    return self
                        .manager
                        .retry_operation_without_fail(
                            operation,
                            DELETE_GARDENER_CLUSTER_STEP,
                            "unable to get instance",
                            Duration::from_secs(15),
                            Duration::from_secs(120),
                            Some(&e),
                        )
                        .await;
                }
            };
            name = instance.runtime_id.to_lowercase();
            let (updated, backoff) = self
                .manager
                .update_operation(operation, |op| {
                    op.instance_details.gardener_cluster_name = name.clone();
                })
                .await;
            if !backoff.is_zero() {
                return Ok((updated, backoff));
            }
            operation = updated;
        }
        if name.is_empty() {
            info!("GardenerCluster not known, skipping");
            return Ok((operation, Duration::ZERO));
        }

        info!(gardener_cluster = %name, namespace = %namespace, "Deleting GardenerCluster resource");
        match self
            .kcp
            .delete(&ResourceKind::GARDENER_CLUSTER, Some(&namespace), &name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => info!("No GardenerCluster resource to delete, ignoring"),
            Err(e) if e.is_no_match() => info!("No GardenerCluster CRD installed, skipping"),
            Err(e) => {
                warn!(error = %e, "Unable to delete the GardenerCluster resource");
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        DELETE_GARDENER_CLUSTER_STEP,
                        "unable to delete the GardenerCluster resource",
                        K8S_OPERATION_BACKOFF,
                        K8S_OPERATION_TIMEOUT,
                        Some(&e),
                    )
                    .await;
            }
        }
        Ok((operation, Duration::ZERO))
    }
}

pub struct CheckGardenerClusterDeletedStep {
    manager: OperationManager,
    kcp: Arc<dyn ClusterClient>,
}

impl CheckGardenerClusterDeletedStep {
    pub fn new(storage: Arc<dyn Persistence>, kcp: Arc<dyn ClusterClient>) -> Self {
        Self {
            manager: OperationManager::new(
                storage,
                CHECK_GARDENER_CLUSTER_DELETED_STEP,
                ErrorComponent::InfrastructureManager,
            ),
            kcp,
        }
    }
}

#[async_trait::async_trait]
impl Step for CheckGardenerClusterDeletedStep {
    fn name(&self) -> &str {
        CHECK_GARDENER_CLUSTER_DELETED_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let namespace = resource_namespace(&operation);
        let name = gardener_cluster_name(&operation);
        if name.is_empty() {
            info!("Empty runtime ID, skipping");
            return Ok((operation, Duration::ZERO));
        }

        match self
            .kcp
            .get(&ResourceKind::GARDENER_CLUSTER, Some(&namespace), &name)
            .await
        {
            Ok(_) => {
                info!("GardenerCluster resource still exists");
                self.manager
                    .retry_operation_without_fail(
                        operation,
                        CHECK_GARDENER_CLUSTER_DELETED_STEP,
                        "GardenerCluster resource still exists",
                        Duration::from_secs(5),
                        Duration::from_secs(60),
                        None,
                    )
                    .await
            }
            Err(e) if e.is_no_match() => {
                info!("No GardenerCluster CRD installed, skipping");
                Ok((operation, Duration::ZERO))
            }
            Err(e) if e.is_not_found() => {
                if operation.instance_details.gardener_cluster_name.is_empty() {
                    return Ok((operation, Duration::ZERO));
                }
                Ok(self
                    .manager
                    .update_operation(operation, |op| {
                        op.instance_details.gardener_cluster_name.clear();
                    })
                    .await)
            }
            Err(e) => {
                warn!(error = %e, "Unable to check GardenerCluster resource existence");
                self.manager
                    .retry_operation_without_fail(
                        operation,
                        CHECK_GARDENER_CLUSTER_DELETED_STEP,
                        "unable to check GardenerCluster resource existence",
                        K8S_OPERATION_BACKOFF,
                        K8S_OPERATION_TIMEOUT,
                        Some(&e),
                    )
                    .await
            }
        }
    }
}
