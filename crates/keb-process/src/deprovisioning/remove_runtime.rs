// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime removal through the legacy provisioner.
//!
//! Both steps are skipped once the Runtime resource step has found that the
//! cluster is controlled by the infrastructure manager alone.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use keb_clients::provisioner::{ProvisionerClient, ProvisionerOperationState};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Instance, Operation};
use keb_core::plans;
use tracing::{error, info, warn};

use super::{CHECK_RUNTIME_REMOVAL_STEP, REMOVE_RUNTIME_STEP};
use crate::operation_manager::{Cause, OperationManager, StepResult, since};
use crate::staged_manager::Step;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(30);
const STATUS_ERROR_BACKOFF: Duration = Duration::from_secs(60);

fn controlled_by_infrastructure_manager_only(operation: &Operation) -> bool {
    operation.kim_deprovisions_only == Some(true)
}

/// Instance lookup shared by both steps: a missing instance ends the step,
/// any other storage error requeues it.
async fn load_instance(
    storage: &Arc<dyn Persistence>,
    operation: &Operation,
) -> Result<Instance, Duration> {
    match storage.get_instance(&operation.instance_id).await {
        Ok(instance) => Ok(instance),
        Err(e) if e.is_not_found() => {
            info!(error = %e, "Instance already deleted");
            Err(Duration::ZERO)
        }
        Err(e) => {
            error!(error = %e, "Unable to get instance from storage");
            Err(Duration::from_secs(1))
        }
    }
}

pub struct RemoveRuntimeStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    provisioner: Arc<dyn ProvisionerClient>,
    timeout: Duration,
}

impl RemoveRuntimeStep {
    pub fn new(
        storage: Arc<dyn Persistence>,
        provisioner: Arc<dyn ProvisionerClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                REMOVE_RUNTIME_STEP,
                ErrorComponent::Provisioner,
            ),
            storage,
            provisioner,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Step for RemoveRuntimeStep {
    fn name(&self) -> &str {
        REMOVE_RUNTIME_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if controlled_by_infrastructure_manager_only(&operation) {
            info!("Runtime is not controlled by the provisioner, skipping");
            return Ok((operation, Duration::ZERO));
        }
        if since(operation.updated_at) > self.timeout {
            info!(updated_at = %operation.updated_at, "Operation has reached the time limit");
            let reason = format!("operation has reached the time limit: {:?}", self.timeout);
            return self.manager.operation_failed(operation, &reason, None).await;
        }

        let instance = match load_instance(&self.storage, &operation).await {
            Ok(instance) => instance,
            Err(backoff) => return Ok((operation, backoff)),
        };
        if instance.runtime_id.is_empty() || plans::is_own_cluster(operation.plan_id()) {
            // Provisioning never created a runtime, or the instance is suspended.
            info!(instance_id = %operation.instance_id, "Runtime does not exist for instance");
            return Ok((operation, Duration::ZERO));
        }
        if !operation.provisioner_operation_id.is_empty() {
            return Ok((operation, Duration::ZERO));
        }

        let provisioner_operation_id = match self
            .provisioner
            .deprovision_runtime(&instance.global_account_id, &instance.runtime_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Unable to deprovision runtime");
                return self
                    .manager
                    .retry_operation_without_fail(
                        operation,
                        REMOVE_RUNTIME_STEP,
                        "unable to deprovision Runtime in Provisioner",
                        Duration::from_secs(15),
                        Duration::from_secs(20 * 60),
                        Some(&e),
                    )
                    .await;
            }
        };
        info!(provisioner_operation_id = %provisioner_operation_id, "Runtime deletion initiated");

        let (operation, backoff) = self
            .manager
            .update_operation(operation, |op| {
                op.provisioner_operation_id = provisioner_operation_id.clone();
            })
            .await;
        if !backoff.is_zero() {
            return Ok((operation, Duration::from_secs(5)));
        }
        Ok((operation, Duration::ZERO))
    }
}

pub struct CheckRuntimeRemovalStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    provisioner: Arc<dyn ProvisionerClient>,
    timeout: Duration,
}

impl CheckRuntimeRemovalStep {
    pub fn new(
        storage: Arc<dyn Persistence>,
        provisioner: Arc<dyn ProvisionerClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                CHECK_RUNTIME_REMOVAL_STEP,
                ErrorComponent::Provisioner,
            ),
            storage,
            provisioner,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Step for CheckRuntimeRemovalStep {
    fn name(&self) -> &str {
        CHECK_RUNTIME_REMOVAL_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if controlled_by_infrastructure_manager_only(&operation) {
            info!("Runtime is not controlled by the provisioner, skipping");
            return Ok((operation, Duration::ZERO));
        }
        if since(operation.updated_at) > self.timeout {
            info!(updated_at = %operation.updated_at, "Operation has reached the time limit");
            let reason = format!(
                "runtime removal check has reached the time limit: {:?}",
                self.timeout
            );
            return self.manager.operation_failed(operation, &reason, None).await;
        }
        if operation.provisioner_operation_id.is_empty() {
            info!("Provisioner operation id is empty, there is no runtime");
            return Ok((operation, Duration::ZERO));
        }

        let instance = match load_instance(&self.storage, &operation).await {
            Ok(instance) => instance,
            Err(backoff) => return Ok((operation, backoff)),
        };

        let status = match self
            .provisioner
            .runtime_operation_status(
                &instance.global_account_id,
                &operation.provisioner_operation_id,
            )
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(
                    error = %e,
                    global_account_id = %instance.global_account_id,
                    provisioner_operation_id = %operation.provisioner_operation_id,
                    "Call to provisioner for the operation status failed"
                );
                return Ok((operation, STATUS_ERROR_BACKOFF));
            }
        };
        info!(
            state = ?status.state,
            message = status.message.as_deref().unwrap_or_default(),
            "Provisioner returned the operation status"
        );

        let last_error = status
            .last_error
            .as_ref()
            .map(|e| format!("{} ({})", e.err_message, e.reason));
        let cause: Cause<'_> = last_error.as_ref().map(|e| e as &(dyn Display + Sync));
        match status.state {
            ProvisionerOperationState::Succeeded => {
                info!(elapsed = ?since(operation.updated_at), "Provisioner succeeded");
                Ok((operation, Duration::ZERO))
            }
            ProvisionerOperationState::InProgress | ProvisionerOperationState::Pending => {
                Ok((operation, STATUS_POLL_INTERVAL))
            }
            ProvisionerOperationState::Failed => {
                self.manager
                    .operation_failed(
                        operation,
                        "provisioner client returns failed status",
                        cause,
                    )
                    .await
            }
            ProvisionerOperationState::Unknown(state) => {
                let reason = format!("unsupported provisioner client status: {state}");
                self.manager
                    .operation_failed(operation, &reason, cause)
                    .await
            }
        }
    }
}
