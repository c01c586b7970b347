// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hand the hyperscaler subscription back to the account pool.

use std::sync::Arc;
use std::time::Duration;

use keb_clients::hyperscaler::{AccountProvider, HyperscalerType, is_eu_restricted_access};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, Operation};
use tracing::{error, info};

use super::{RELEASE_SUBSCRIPTION_STEP, TEMPORARY_ERROR_BACKOFF, TEMPORARY_ERROR_WINDOW};
use crate::operation_manager::{OperationManager, StepResult};
use crate::staged_manager::Step;

pub struct ReleaseSubscriptionStep {
    manager: OperationManager,
    storage: Arc<dyn Persistence>,
    accounts: Arc<dyn AccountProvider>,
    excluded_plans: Vec<String>,
}

impl ReleaseSubscriptionStep {
    /// Plans listed in `excluded_plans` never hold a pooled subscription.
    pub fn new(
        storage: Arc<dyn Persistence>,
        accounts: Arc<dyn AccountProvider>,
        excluded_plans: Vec<String>,
    ) -> Self {
        Self {
            manager: OperationManager::new(
                storage.clone(),
                RELEASE_SUBSCRIPTION_STEP,
                ErrorComponent::AccountPool,
            ),
            storage,
            accounts,
            excluded_plans,
        }
    }

    fn needs_release(&self, plan_id: &str) -> bool {
        !self.excluded_plans.iter().any(|p| p == plan_id)
    }
}

#[async_trait::async_trait]
impl Step for ReleaseSubscriptionStep {
    fn name(&self) -> &str {
        RELEASE_SUBSCRIPTION_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let plan_id = operation.plan_id().to_string();
        if !self.needs_release(&plan_id) {
            return Ok((operation, Duration::ZERO));
        }

        let instance = match self.storage.get_instance(&operation.instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                let message = format!(
                    "after successful deprovisioning failing to release hyperscaler subscription - get the instance data for instanceID [{}]: {e}",
                    operation.instance_id
                );
                return self
                    .manager
                    .mark_step_as_executed_but_not_completed(
                        operation,
                        RELEASE_SUBSCRIPTION_STEP,
                        &message,
                    )
                    .await;
            }
        };
        if instance.provider.is_empty() {
            info!("Instance does not contain cloud provider info due to failed provisioning, skipping");
            return Ok((operation, Duration::ZERO));
        }

        let platform_region = operation.provisioning_parameters.platform_region.clone();
        let hyperscaler_type = match HyperscalerType::from_provider(
            &instance.provider,
            &instance.provider_region,
            &platform_region,
        ) {
            Ok(hyperscaler_type) => hyperscaler_type,
            Err(e) => {
                let message = format!(
                    "after successful deprovisioning failing to release hyperscaler subscription - determine the type of hyperscaler to use for planID [{plan_id}]: {e}"
                );
                return self
                    .manager
                    .mark_step_as_executed_but_not_completed(
                        operation,
                        RELEASE_SUBSCRIPTION_STEP,
                        &message,
                    )
                    .await;
            }
        };

        let tenant = if instance.subscription_global_account_id.is_empty() {
            instance.global_account_id.as_str()
        } else {
            instance.subscription_global_account_id.as_str()
        };
        let eu_access = is_eu_restricted_access(&platform_region);
        match self
            .accounts
            .mark_unused_secret_binding_as_dirty(&hyperscaler_type, tenant, eu_access)
            .await
        {
            Ok(()) => {
                info!(hyperscaler_type = %hyperscaler_type, tenant, eu_access, "Hyperscaler subscription released");
                Ok((operation, Duration::ZERO))
            }
            Err(e) => {
                error!(error = %e, "After successful deprovisioning failed to release hyperscaler subscription");
                self.manager
                    .retry_operation_without_fail(
                        operation,
                        RELEASE_SUBSCRIPTION_STEP,
                        "failed to release hyperscaler subscription",
                        TEMPORARY_ERROR_BACKOFF,
                        TEMPORARY_ERROR_WINDOW,
                        Some(&e),
                    )
                    .await
            }
        }
    }
}
