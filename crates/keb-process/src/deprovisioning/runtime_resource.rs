// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletion of the Runtime custom resource handled by the infrastructure
//! manager.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::cluster::{ClusterClient, ResourceKind, label};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation};
use kube::core::DynamicObject;
use tracing::{info, warn};

use super::{
    CHECK_RUNTIME_RESOURCE_DELETED_STEP, DELETE_RUNTIME_RESOURCE_STEP, K8S_OPERATION_BACKOFF,
    K8S_OPERATION_TIMEOUT, KCP_NAMESPACE,
};
use crate::operation_manager::{OperationManager, StepResult, since};
use crate::staged_manager::Step;

/// Runtime label naming the controller of the cluster.
pub const CONTROLLED_BY_PROVISIONER_LABEL: &str = "kyma-project.io/controlled-by-provisioner";

const RUNTIME_DELETION_POLL_INTERVAL: Duration = Duration::from_secs(20);
const RUNTIME_READ_BACKOFF: Duration = Duration::from_secs(5);
const RUNTIME_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A Runtime is provisioner-controlled unless labelled otherwise.
fn is_controlled_by_provisioner(runtime: &DynamicObject) -> bool {
    label(runtime, CONTROLLED_BY_PROVISIONER_LABEL) != Some("false")
}

fn runtime_resource_name(operation: &Operation) -> String {
    if !operation.instance_details.runtime_resource_name.is_empty() {
        return operation.instance_details.runtime_resource_name.clone();
    }
    operation.runtime_id().to_lowercase()
}

pub struct DeleteRuntimeResourceStep {
    manager: OperationManager,
    kcp: Arc<dyn ClusterClient>,
}

impl DeleteRuntimeResourceStep {
    pub fn new(storage: Arc<dyn Persistence>, kcp: Arc<dyn ClusterClient>) -> Self {
        Self {
            manager: OperationManager::new(
                storage,
                DELETE_RUNTIME_RESOURCE_STEP,
                ErrorComponent::InfrastructureManager,
            ),
            kcp,
        }
    }
}

#[async_trait::async_trait]
impl Step for DeleteRuntimeResourceStep {
    fn name(&self) -> &str {
        DELETE_RUNTIME_RESOURCE_STEP
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        let name = runtime_resource_name(&operation);
        if name.is_empty() {
            info!("Runtime resource name is empty, skipping");
            return Ok((operation, Duration::ZERO));
        }
        let namespace = operation.instance_details.kyma_resource_namespace.clone();
        if namespace.is_empty() {
            warn!("Namespace for Runtime resource not specified");
            return Ok((operation, Duration::ZERO));
        }

        let runtime = match self
            .kcp
            .get(&ResourceKind::RUNTIME, Some(&namespace), &name)
            .await
        {
            Ok(runtime) => runtime,
            Err(e) if e.is_not_found() => {
                info!("Runtime resource already deleted");
                return Ok((operation, Duration::ZERO));
            }
            Err(e) if e.is_no_match() => {
                info!("No Runtime CRD installed, skipping");
                return Ok((operation, Duration::ZERO));
            }
            Err(e) if since(operation.updated_at) < RUNTIME_READ_TIMEOUT => {
                warn!(error = %e, "Unable to read runtime, retrying");
                return Ok((operation, RUNTIME_READ_BACKOFF));
            }
            Err(e) => {
                // The controller stays unknown, so the provisioner path runs as well.
                warn!(
                    error = %e,
                    timeout = ?RUNTIME_READ_TIMEOUT,
                    "Unable to read runtime, continuing without deleting it"
                );
                return Ok((operation, Duration::ZERO));
            }
        };

        // Recorded once, on the first attempt.
        if operation.kim_deprovisions_only.is_none() {
            let kim_only = !is_controlled_by_provisioner(&runtime);
            let (updated, backoff) = self
                .manager
                .update_operation(operation, |op| op.kim_deprovisions_only = Some(kim_only))
                .await;
            if !backoff.is_zero() {
                return Ok((updated, backoff));
            }
            operation = updated;
        }

        match self
            .kcp
            .delete(&ResourceKind::RUNTIME, Some(&namespace), &name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_no_match() => info!("No Runtime CRD installed, skipping"),
            Err(e) if e.is_not_found() => info!("Runtime resource already deleted"),
            Err(e) => {
                warn!(error = %e, runtime = %name, namespace = %namespace, "Unable to delete the Runtime resource");
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        DELETE_RUNTIME_RESOURCE_STEP,
                        "unable to delete the Runtime resource",
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

pub struct CheckRuntimeResourceDeletedStep {
    manager: OperationManager,
    kcp: Arc<dyn ClusterClient>,
    deletion_timeout: Duration,
}

impl CheckRuntimeResourceDeletedStep {
    pub fn new(
        storage: Arc<dyn Persistence>,
        kcp: Arc<dyn ClusterClient>,
        deletion_timeout: Duration,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage,
                CHECK_RUNTIME_RESOURCE_DELETED_STEP,
                ErrorComponent::InfrastructureManager,
            ),
            kcp,
            deletion_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Step for CheckRuntimeResourceDeletedStep {
    fn name(&self) -> &str {
        CHECK_RUNTIME_RESOURCE_DELETED_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let mut namespace = operation.instance_details.kyma_resource_namespace.clone();
        if namespace.is_empty() {
            warn!("Namespace for Kyma resource not specified, using {KCP_NAMESPACE}");
            namespace = KCP_NAMESPACE.to_string();
        }
        let name = runtime_resource_name(&operation);
        if name.is_empty() {
            info!("Empty runtime ID, skipping");
            return Ok((operation, Duration::ZERO));
        }

        match self
            .kcp
            .get(&ResourceKind::RUNTIME, Some(&namespace), &name)
            .await
        {
            Ok(_) => {
                if since(operation.updated_at) < self.deletion_timeout {
                    info!("Runtime resource still exists");
                } else {
                    warn!(
                        timeout = ?self.deletion_timeout,
                        "Runtime resource still exists after the deletion timeout"
                    );
                }
                Ok((operation, RUNTIME_DELETION_POLL_INTERVAL))
            }
            Err(e) if e.is_no_match() => {
                info!("No Runtime CRD installed, skipping");
                Ok((operation, Duration::ZERO))
            }
            Err(e) if e.is_not_found() => {
                if operation.instance_details.runtime_resource_name.is_empty() {
                    return Ok((operation, Duration::ZERO));
                }
                Ok(self
                    .manager
                    .update_operation(operation, |op| {
                        op.instance_details.runtime_resource_name.clear();
                    })
                    .await)
            }
            Err(e) => {
                warn!(error = %e, "Unable to check Runtime resource existence, retrying");
                Ok((operation, K8S_OPERATION_BACKOFF))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures::{self, OPERATION_ID, RUNTIME_ID};
    use keb_clients::cluster::FakeCluster;
    use keb_core::plans;
    use std::collections::BTreeMap;

    async fn kcp_with_runtime(controlled_by_provisioner: Option<&str>) -> Arc<FakeCluster> {
        let kcp = Arc::new(FakeCluster::new());
        kcp.install(&ResourceKind::RUNTIME).await;
        let mut obj = ResourceKind::RUNTIME.object(Some(KCP_NAMESPACE), &RUNTIME_ID.to_lowercase());
        if let Some(value) = controlled_by_provisioner {
            obj.metadata.labels = Some(BTreeMap::from([(
                CONTROLLED_BY_PROVISIONER_LABEL.to_string(),
                value.to_string(),
            )]));
        }
        kcp.insert(&ResourceKind::RUNTIME, obj).await;
        kcp
    }

    #[tokio::test]
    async fn test_kim_only_runtime_is_recorded_and_deleted() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(Some("false")).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        let step = DeleteRuntimeResourceStep::new(store.clone(), kcp.clone());

        let (op, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(op.kim_deprovisions_only, Some(true));
        assert_eq!(kcp.count(&ResourceKind::RUNTIME).await, 0);
        assert_eq!(
            store.get_operation(OPERATION_ID).await.unwrap().kim_deprovisions_only,
            Some(true)
        );

        let (again, backoff) = step.run(op.clone()).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(again, op);
    }

    #[tokio::test]
    async fn test_provisioner_controlled_runtime() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(None).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;

        let (op, _) = DeleteRuntimeResourceStep::new(store.clone(), kcp)
            .run(op)
            .await
            .unwrap();
        assert_eq!(op.kim_deprovisions_only, Some(false));
    }

    #[tokio::test]
    async fn test_unreadable_runtime_leaves_controller_unknown() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(Some("false")).await;
        kcp.fail_kind(&ResourceKind::RUNTIME, Some(500)).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;

        let (op, backoff) = DeleteRuntimeResourceStep::new(store.clone(), kcp)
            .run(op)
            .await
            .unwrap();
        assert_eq!(backoff, Duration::from_secs(5));
        assert_eq!(op.kim_deprovisions_only, None);
    }

    #[tokio::test]
    async fn test_unreadable_runtime_does_not_fail_operation() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(Some("false")).await;
        kcp.fail_kind(&ResourceKind::RUNTIME, Some(500)).await;
        let mut op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        let state = op.state;
        op.updated_at -= chrono::Duration::minutes(2);

        let (op, backoff) = DeleteRuntimeResourceStep::new(store.clone(), kcp.clone())
            .run(op)
            .await
            .unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(op.kim_deprovisions_only, None);
        assert!(op.executed_but_not_completed.is_empty());
        let stored = store.get_operation(OPERATION_ID).await.unwrap();
        assert_eq!(stored.state, state);
        assert_eq!(stored.kim_deprovisions_only, None);
        assert!(stored.last_error.is_none());
        kcp.fail_kind(&ResourceKind::RUNTIME, None).await;
        assert_eq!(kcp.count(&ResourceKind::RUNTIME).await, 1);
    }

    #[tokio::test]
    async fn test_check_runtime_resource_deleted() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(None).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        let step = CheckRuntimeResourceDeletedStep::new(store.clone(), kcp.clone(), Duration::from_secs(3600));

        let (mut op, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(20));

        // Past the deletion timeout the step keeps waiting; only the
        // operation deadline ends it.
        op.updated_at -= chrono::Duration::hours(2);
        let (op, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(20));
        assert!(op.executed_but_not_completed.is_empty());
        assert!(
            store
                .get_operation(OPERATION_ID)
                .await
                .unwrap()
                .executed_but_not_completed
                .is_empty()
        );

        kcp.delete(&ResourceKind::RUNTIME, Some(KCP_NAMESPACE), &RUNTIME_ID.to_lowercase())
            .await
            .unwrap();
        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unreadable_runtime_check_keeps_retrying() {
        let store = fixtures::store().await;
        let kcp = kcp_with_runtime(None).await;
        kcp.fail_kind(&ResourceKind::RUNTIME, Some(500)).await;
        let mut op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        op.updated_at -= chrono::Duration::hours(2);
        let step = CheckRuntimeResourceDeletedStep::new(store.clone(), kcp, Duration::from_secs(3600));

        let (op, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, K8S_OPERATION_BACKOFF);
        assert!(op.executed_but_not_completed.is_empty());
    }
}
