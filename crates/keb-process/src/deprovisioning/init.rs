// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! First step: wait for the previous operation and move to in progress.

use std::sync::Arc;
use std::time::Duration;

use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation, OperationState};
use tracing::{info, warn};

use super::INIT_STEP;
use crate::operation_manager::{OperationManager, StepResult, since};
use crate::staged_manager::Step;

/// Delay while another operation on the instance is still running.
const CONCURRENT_OPERATION_BACKOFF: Duration = Duration::from_secs(60);

pub struct InitStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    operation_timeout: Duration,
}

impl InitStep {
    pub fn new(storage: Arc<dyn Persistence>, operation_timeout: Duration) -> Self {
        Self {
            manager: OperationManager::new(storage.clone(), INIT_STEP, ErrorComponent::Keb),
            storage,
            operation_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Step for InitStep {
    fn name(&self) -> &str {
        INIT_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if since(operation.created_at) > self.operation_timeout {
            info!(created_at = %operation.created_at, "Operation has reached the time limit");
            let reason = format!(
                "operation has reached the time limit: {:?}",
                self.operation_timeout
            );
            return self.manager.operation_failed(operation, &reason, None).await;
        }

        if operation.state != OperationState::Pending {
            return Ok((operation, Duration::ZERO));
        }

        let last_ers_context = match self.storage.get_last_operation(&operation.instance_id).await {
            Ok(last) if !last.is_finished() => {
                info!(
                    last_operation_id = %last.id,
                    last_operation_type = %last.operation_type,
                    "Waiting for the previous operation to be finished"
                );
                return Ok((operation, CONCURRENT_OPERATION_BACKOFF));
            }
            Ok(last) => Some(last.provisioning_parameters.ers_context),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(error = %e, "Unable to get the last operation");
                return Ok((operation, CONCURRENT_OPERATION_BACKOFF));
            }
        };

        let instance = match self.storage.get_instance(&operation.instance_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                warn!("The instance was already deprovisioned");
                return self
                    .manager
                    .operation_failed(operation, "the instance was already deprovisioned", Some(&e))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to get the instance");
                return Ok((operation, Duration::from_secs(1)));
            }
        };

        info!("Setting state 'in progress' and refreshing instance details");
        let (updated, backoff) = self
            .manager
            .update_operation(operation.clone(), |op| {
                op.state = OperationState::InProgress;
                op.instance_details = instance.instance_details.clone();
                if let Some(previous) = &last_ers_context {
                    op.provisioning_parameters
                        .ers_context
                        .inherit_missing(previous);
                }
            })
            .await;
        if !backoff.is_zero() {
            warn!("Unable to move the operation to 'in progress', retrying");
            return Ok((operation, backoff));
        }
        Ok((updated, Duration::ZERO))
    }
}
