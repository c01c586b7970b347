// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletion of the Kyma custom resource in the control plane.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::cluster::{ClusterClient, ResourceKind};
use keb_core::model::{ErrorComponent, Operation};
use keb_core::{Persistence, plans};
use serde::Deserialize;
use tracing::{info, warn};

use super::{
    CHECK_KYMA_RESOURCE_DELETED_STEP, DELETE_KYMA_RESOURCE_STEP, K8S_OPERATION_BACKOFF,
    K8S_OPERATION_TIMEOUT,
};
use crate::operation_manager::{OperationManager, StepResult, since};
use crate::plan_config::PlanConfigProvider;
use crate::staged_manager::Step;

const KYMA_DELETION_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeHeader {
    api_version: String,
    kind: String,
}

/// Kind of the object described by a kyma template.
pub(crate) fn kyma_kind(template: &str) -> Result<ResourceKind, serde_yaml::Error> {
    let header: TypeHeader = serde_yaml::from_str(template)?;
    Ok(ResourceKind::custom(&header.api_version, &header.kind))
}

/// Stored Kyma resource name, or the lowercased runtime id.
pub(crate) fn kyma_name(operation: &Operation) -> String {
    if !operation.instance_details.kyma_resource_name.is_empty() {
        return operation.instance_details.kyma_resource_name.clone();
    }
    operation.runtime_id().to_lowercase()
}

pub struct DeleteKymaResourceStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    kcp: Arc<dyn ClusterClient>,
    plan_config: Arc<dyn PlanConfigProvider>,
}

impl DeleteKymaResourceStep {
    pub fn new(
        storage: Arc<dyn Persistence>,
        kcp: Arc<dyn ClusterClient>,
        plan_config: Arc<dyn PlanConfigProvider>,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                DELETE_KYMA_RESOURCE_STEP,
                ErrorComponent::LifecycleManager,
            ),
            storage,
            kcp,
            plan_config,
        }
    }
}

#[async_trait::async_trait]
impl Step for DeleteKymaResourceStep {
    fn name(&self) -> &str {
        DELETE_KYMA_RESOURCE_STEP
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        if operation.kyma_template.is_empty() {
            let plan_name = plans::plan_name(operation.plan_id());
            let config = match self.plan_config.for_plan(plan_name).await {
                Ok(config) => config,
                Err(e) => {
                    return self
                        .manager
                        .retry_operation_without_fail(
                            operation,
                            DELETE_KYMA_RESOURCE_STEP,
                            "unable to get config for given plan",
                            Duration::from_secs(5),
                            Duration::from_secs(30),
                            Some(&e),
                        )
                        .await;
                }
            };
            let (updated, backoff) = self
                .manager
                .update_operation(operation, |op| op.kyma_template = config.kyma_template.clone())
                .await;
            if !backoff.is_zero() {
                return Ok((updated, backoff));
            }
            operation = updated;
        }

        let kind = match kyma_kind(&operation.kyma_template) {
            Ok(kind) => kind,
            Err(e) => {
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        DELETE_KYMA_RESOURCE_STEP,
                        "unable to decode kyma template",
                        Duration::from_secs(5),
                        Duration::from_secs(30),
                        Some(&e),
                    )
                    .await;
            }
        };

        let namespace = operation.instance_details.kyma_resource_namespace.clone();
        if namespace.is_empty() {
            warn!("Namespace for Kyma resource not specified");
            return Ok((operation, Duration::ZERO));
        }

        let mut name = kyma_name(&operation);
        if name.is_empty() {
            info!("Kyma resource name is empty, using the runtime id of the instance");
            let instance = match self.storage.get_instance(&operation.instance_id).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(error = %e, "Unable to get instance");
                    return self
                        .manager
                        .retry_operation_without_fail(
                            operation,
                            DELETE_KYMA_RESOURCE_STEP,
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
                    op.instance_details.kyma_resource_name = name.clone();
                })
                .await;
            if !backoff.is_zero() {
                return Ok((updated, backoff));
            }
            operation = updated;
        }
        if name.is_empty() {
            info!("Kyma resource name is empty, skipping");
            return Ok((operation, Duration::ZERO));
        }

        info!(kyma_name = %name, namespace = %namespace, "Deleting Kyma resource");
        match self.kcp.delete(&kind, Some(&namespace), &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => info!("No Kyma resource to delete, ignoring"),
            Err(e) if e.is_no_match() => info!("No Kyma CRD installed, skipping"),
            Err(e) => {
                warn!(error = %e, "Unable to delete the Kyma resource");
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        DELETE_KYMA_RESOURCE_STEP,
                        "unable to delete the Kyma resource",
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

pub struct CheckKymaResourceDeletedStep {
    manager: OperationManager,
    kcp: Arc<dyn ClusterClient>,
    deletion_timeout: Duration,
}

impl CheckKymaResourceDeletedStep {
    pub fn new(
        storage: Arc<dyn Persistence>,
        kcp: Arc<dyn ClusterClient>,
        deletion_timeout: Duration,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage,
                CHECK_KYMA_RESOURCE_DELETED_STEP,
                ErrorComponent::LifecycleManager,
            ),
            kcp,
            deletion_timeout,
        }
    }

    async fn forget_name(&self, operation: Operation) -> StepResult {
        if operation.instance_details.kyma_resource_name.is_empty() {
            return Ok((operation, Duration::ZERO));
        }
        Ok(self
            .manager
            .update_operation(operation, |op| op.instance_details.kyma_resource_name.clear())
            .await)
    }
}

#[async_trait::async_trait]
impl Step for CheckKymaResourceDeletedStep {
    fn name(&self) -> &str {
        CHECK_KYMA_RESOURCE_DELETED_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let namespace = operation.instance_details.kyma_resource_namespace.clone();
        if namespace.is_empty() {
            warn!("Namespace for Kyma resource not specified");
            return Ok((operation, Duration::ZERO));
        }
        let name = kyma_name(&operation);
        if name.is_empty() {
            info!("Kyma resource name is empty, skipping");
            return Ok((operation, Duration::ZERO));
        }
        let kind = match kyma_kind(&operation.kyma_template) {
            Ok(kind) => kind,
            Err(e) => {
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        CHECK_KYMA_RESOURCE_DELETED_STEP,
                        "unable to decode kyma template",
                        Duration::from_secs(5),
                        Duration::from_secs(30),
                        Some(&e),
                    )
                    .await;
            }
        };

        info!(kyma_name = %name, namespace = %namespace, "Checking existence of Kyma resource");
        match self.kcp.get(&kind, Some(&namespace), &name).await {
            Ok(_) if since(operation.updated_at) < self.deletion_timeout => {
                info!("Kyma resource still exists");
                Ok((operation, KYMA_DELETION_POLL_INTERVAL))
            }
            Ok(_) => {
                // The lifecycle manager finishes the removal on its own.
                warn!(
                    timeout = ?self.deletion_timeout,
                    "Kyma resource still exists after the deletion timeout, continuing"
                );
                self.forget_name(operation).await
            }
            Err(e) if e.is_not_found() || e.is_no_match() => self.forget_name(operation).await,
            Err(e) => {
                warn!(error = %e, "Unable to check Kyma resource existence");
                self.manager
                    .retry_operation_without_fail(
                        operation,
                        CHECK_KYMA_RESOURCE_DELETED_STEP,
                        "unable to check Kyma resource existence",
                        K8S_OPERATION_BACKOFF,
                        K8S_OPERATION_TIMEOUT,
                        Some(&e),
                    )
                    .await
            }
        }
    }
}
