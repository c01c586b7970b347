// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removal of the subaccount's data tenant from the Event Data Platform.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::ClientError;
use keb_clients::edp::{EdpClient, EdpConfig, METADATA_KEYS};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation, OperationType};
use keb_core::persistence::InstanceFilter;
use tracing::{error, info, warn};

use super::{EDP_DEREGISTRATION_STEP, TEMPORARY_ERROR_BACKOFF, TEMPORARY_ERROR_WINDOW};
use crate::operation_manager::{OperationManager, StepResult};
use crate::staged_manager::Step;

pub struct EdpDeregistrationStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    client: Arc<dyn EdpClient>,
    config: EdpConfig,
}

impl EdpDeregistrationStep {
    pub fn new(storage: Arc<dyn Persistence>, client: Arc<dyn EdpClient>, config: EdpConfig) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                EDP_DEREGISTRATION_STEP,
                ErrorComponent::Edp,
            ),
            storage,
            client,
            config,
        }
    }

    /// Ids of other instances of the subaccount that still use the data
    /// tenant.
    async fn instances_using_tenant(
        &self,
        subaccount_id: &str,
    ) -> Result<Vec<String>, keb_core::StorageError> {
        let filter = InstanceFilter {
            subaccount_ids: vec![subaccount_id.to_string()],
            ..Default::default()
        };
        let mut ids = Vec::new();
        for instance in self.storage.list_instances(&filter).await? {
            let last = self.storage.get_last_operation(&instance.instance_id).await?;
            if last.operation_type != OperationType::Deprovision {
                ids.push(instance.instance_id);
            }
        }
        Ok(ids)
    }

    async fn handle_error(&self, operation: Operation, err: ClientError, message: &str) -> StepResult {
        error!(error = %err, "{message}");
        let description = format!(
            "Step {EDP_DEREGISTRATION_STEP} failed. EDP data have not been deleted."
        );
        if err.is_temporary() {
            return self
                .manager
                .retry_operation_without_fail(
                    operation,
                    EDP_DEREGISTRATION_STEP,
                    &description,
                    TEMPORARY_ERROR_BACKOFF,
                    TEMPORARY_ERROR_WINDOW,
                    Some(&err),
                )
                .await;
        }
        self.manager
            .mark_step_as_executed_but_not_completed(operation, EDP_DEREGISTRATION_STEP, &description)
            .await
    }
}

#[async_trait::async_trait]
impl Step for EdpDeregistrationStep {
    fn name(&self) -> &str {
        EDP_DEREGISTRATION_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if self.config.disabled {
            info!("EDP integration is disabled, skipping");
            return Ok((operation, Duration::ZERO));
        }

        let subaccount_id = operation.subaccount_id().to_string();
        match self.instances_using_tenant(&subaccount_id).await {
            Ok(ids) if !ids.is_empty() => {
                info!(
                    instances = %ids.join(", "),
                    "Skipping EDP deregistration due to existing other instances"
                );
                return Ok((operation, Duration::ZERO));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Unable to check other instances of the subaccount");
                return Ok((operation, Duration::from_secs(1)));
            }
        }

        let tenant = subaccount_id.to_lowercase();
        let environment = self.config.environment.as_str();
        info!(tenant = %tenant, "Deleting DataTenant metadata");
        for key in METADATA_KEYS {
            if let Err(e) = self.client.delete_metadata_tenant(&tenant, environment, key).await {
                let message = format!("cannot remove DataTenant metadata with key: {key}");
                return self.handle_error(operation, e, &message).await;
            }
        }

        info!(tenant = %tenant, "Deleting DataTenant");
        if let Err(e) = self.client.delete_data_tenant(&tenant, environment).await {
            return self.handle_error(operation, e, "cannot remove DataTenant").await;
        }
        Ok((operation, Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures::{self, SUBACCOUNT_ID};
    use keb_clients::edp::{DataTenantPayload, FakeEdpClient};
    use keb_core::model::{Instance, OperationState};
    use keb_core::plans;

    const ENV: &str = "prod";

    async fn edp_with_tenant() -> Arc<FakeEdpClient> {
        let edp = Arc::new(FakeEdpClient::new());
        let tenant = SUBACCOUNT_ID.to_lowercase();
        edp.create_data_tenant(&DataTenantPayload {
            name: tenant.clone(),
            environment: ENV.to_string(),
            secret_key: "c2VjcmV0".to_string(),
        })
        .await
        .unwrap();
        for key in METADATA_KEYS {
            edp.create_metadata_tenant(&tenant, ENV, key, "value").await.unwrap();
        }
        edp
    }

    /// The instance being deprovisioned: its last operation is the
    /// deprovisioning itself.
    async fn deprovisioning_instance(store: &Arc<dyn Persistence>) -> Operation {
        fixtures::seed_instance(store, &fixtures::instance(plans::AWS_PLAN_ID)).await;
        fixtures::insert(store, &fixtures::operation(plans::AWS_PLAN_ID)).await
    }

    #[tokio::test]
    async fn test_data_tenant_is_deleted() {
        let store = fixtures::store().await;
        let op = deprovisioning_instance(&store).await;
        let edp = edp_with_tenant().await;
        let step = EdpDeregistrationStep::new(store.clone(), edp.clone(), EdpConfig::default());

        let (op, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert!(!edp.has_tenant(&SUBACCOUNT_ID.to_lowercase(), ENV).await);

        // Deleting a missing tenant is not an error.
        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_tenant_is_kept_for_other_instances() {
        let store = fixtures::store().await;
        let op = deprovisioning_instance(&store).await;
        let mut other = Instance::new("inst-2", plans::AWS_PLAN_ID);
        other.subaccount_id = SUBACCOUNT_ID.to_string();
        fixtures::seed_instance(&store, &other).await;
        let edp = edp_with_tenant().await;

        let (_, backoff) = EdpDeregistrationStep::new(store.clone(), edp.clone(), EdpConfig::default())
            .run(op)
            .await
            .unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert!(edp.has_tenant(&SUBACCOUNT_ID.to_lowercase(), ENV).await);
    }

    #[tokio::test]
    async fn test_temporary_errors_are_retried_then_recorded() {
        let store = fixtures::store().await;
        let op = deprovisioning_instance(&store).await;
        let edp = edp_with_tenant().await;
        edp.fail_temporarily(5).await;
        let step = EdpDeregistrationStep::new(store.clone(), edp.clone(), EdpConfig::default());

        let (mut op, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(10));

        op.updated_at -= chrono::Duration::minutes(31);
        let (op, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(op.state, OperationState::InProgress);
        assert_eq!(
            op.executed_but_not_completed,
            vec![EDP_DEREGISTRATION_STEP.to_string()]
        );
        assert!(edp.has_tenant(&SUBACCOUNT_ID.to_lowercase(), ENV).await);
    }

    #[tokio::test]
    async fn test_disabled_integration_is_skipped() {
        let store = fixtures::store().await;
        let op = deprovisioning_instance(&store).await;
        let edp = edp_with_tenant().await;
        let config = EdpConfig {
            disabled: true,
            ..Default::default()
        };

        let (_, backoff) = EdpDeregistrationStep::new(store.clone(), edp.clone(), config)
            .run(op)
            .await
            .unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert!(edp.has_tenant(&SUBACCOUNT_ID.to_lowercase(), ENV).await);
    }
}
