// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removal of the instance row, or of its runtime id for suspensions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Instance, Operation};
use tracing::{error, info};

use super::REMOVE_INSTANCE_STEP;
use crate::operation_manager::{OperationManager, StepResult};
use crate::staged_manager::Step;

const INSTANCE_UPDATE_BACKOFF: Duration = Duration::from_secs(60);

pub struct RemoveInstanceStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
}

impl RemoveInstanceStep {
    pub fn new(storage: Arc<dyn Persistence>) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                REMOVE_INSTANCE_STEP,
                ErrorComponent::KebDb,
            ),
            storage,
        }
    }

    async fn suspend(&self, operation: Operation, mut instance: Instance) -> StepResult {
        info!("Removing the runtime id from the instance");
        instance.runtime_id.clear();
        if let Err(e) = self.storage.update_instance(&instance).await {
            error!(error = %e, "Unable to update the instance");
            return Ok((operation, INSTANCE_UPDATE_BACKOFF));
        }
        if operation.instance_details.runtime_id.is_empty() {
            return Ok((operation, Duration::ZERO));
        }
        Ok(self
            .manager
            .update_operation(operation, |op| op.instance_details.runtime_id.clear())
            .await)
    }

    async fn mark_deleted(&self, operation: Operation, mut instance: Instance) -> StepResult {
        if instance.deleted_at.is_some() {
            return Ok((operation, Duration::ZERO));
        }
        info!("Marking the instance as deleted, its operations are kept for a retrigger");
        instance.deleted_at = Some(Utc::now());
        if let Err(e) = self.storage.update_instance(&instance).await {
            error!(error = %e, "Unable to update the instance");
            return Ok((operation, INSTANCE_UPDATE_BACKOFF));
        }
        Ok((operation, Duration::ZERO))
    }

    async fn remove(&self, operation: Operation) -> StepResult {
        info!("Removing the instance permanently");
        match self.storage.delete_instance(&operation.instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(error = %e, "Unable to remove the instance");
                return Ok((operation, INSTANCE_UPDATE_BACKOFF));
            }
        }
        Ok(self
            .manager
            .update_operation(operation, |op| {
                op.provisioning_parameters.ers_context.user_id = None;
            })
            .await)
    }
}

#[async_trait::async_trait]
impl Step for RemoveInstanceStep {
    fn name(&self) -> &str {
        REMOVE_INSTANCE_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let instance = match self.storage.get_instance(&operation.instance_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                info!("Instance already deleted");
                return Ok((operation, Duration::ZERO));
            }
            Err(e) => {
                error!(error = %e, "Unable to get the instance");
                return Ok((operation, Duration::from_secs(1)));
            }
        };

        if operation.temporary {
            self.suspend(operation, instance).await
        } else if !operation.executed_but_not_completed.is_empty() {
            self.mark_deleted(operation, instance).await
        } else {
            self.remove(operation).await
        }
    }
}
