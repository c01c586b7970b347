// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive record for a deprovisioned instance.

use std::sync::Arc;
use std::time::Duration;

use keb_core::Persistence;
use keb_core::model::{InstanceArchived, Operation};
use tracing::{debug, error, info, warn};

use super::ARCHIVING_STEP;
use crate::config::StepSwitch;
use crate::operation_manager::StepResult;
use crate::staged_manager::Step;

/// Backoff after a failed database call.
pub(crate) const DB_RETRY_BACKOFF: Duration = Duration::from_secs(2);

pub struct ArchivingStep {
    storage: Arc<dyn Persistence>,
    switch: StepSwitch,
}

impl ArchivingStep {
    pub fn new(storage: Arc<dyn Persistence>, switch: StepSwitch) -> Self {
        Self { storage, switch }
    }
}

#[async_trait::async_trait]
impl Step for ArchivingStep {
    fn name(&self) -> &str {
        ARCHIVING_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if !self.switch.enabled {
            return Ok((operation, Duration::ZERO));
        }
        if operation.temporary {
            info!("Suspension operation, skipping");
            return Ok((operation, Duration::ZERO));
        }
        if !operation.executed_but_not_completed.is_empty() {
            info!("Operation needs a retrigger, skipping");
            return Ok((operation, Duration::ZERO));
        }

        match self.storage.get_instance_archived(&operation.instance_id).await {
            Ok(_) => {
                warn!("Archived instance already exists, skipping");
                return Ok((operation, Duration::ZERO));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(error = %e, "Unable to get archived instance");
                return Ok((operation, DB_RETRY_BACKOFF));
            }
        }

        let instance = match self.storage.get_instance(&operation.instance_id).await {
            Ok(instance) => Some(instance),
            Err(e) if e.is_not_found() => {
                error!("Instance not found");
                None
            }
            Err(e) => {
                error!(error = %e, "Unable to get instance");
                return Ok((operation, DB_RETRY_BACKOFF));
            }
        };

        let operations = match self
            .storage
            .list_operations_by_instance_id(&operation.instance_id)
            .await
        {
            Ok(operations) => operations,
            Err(e) => {
                error!(error = %e, "Unable to get operations for given instance");
                return Ok((operation, DB_RETRY_BACKOFF));
            }
        };

        let archived = match &instance {
            Some(instance) => {
                info!(operations = operations.len(), "Creating instance archived from the instance and operations");
                InstanceArchived::from_instance_and_operations(instance, &operations)
            }
            None => {
                info!(operations = operations.len(), "Creating instance archived from operations");
                InstanceArchived::from_operations(&operations)
            }
        };
        let archived = match archived {
            Ok(archived) => archived,
            Err(e) => {
                error!(error = %e, "Unable to create instance archived");
                return Ok((operation, Duration::ZERO));
            }
        };

        if self.switch.dry_run {
            info!("Dry run enabled, skipping insert of archived instance");
            debug!(archived = ?archived, "Archived instance");
            return Ok((operation, Duration::ZERO));
        }

        match self.storage.insert_instance_archived(&archived).await {
            Ok(()) => Ok((operation, Duration::ZERO)),
            Err(e) if e.is_already_exists() => Ok((operation, Duration::ZERO)),
            Err(e) => {
                error!(error = %e, "Unable to insert archived instance");
                Ok((operation, DB_RETRY_BACKOFF))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures::{self, INSTANCE_ID};
    use keb_core::plans;

    const ENABLED: StepSwitch = StepSwitch {
        enabled: true,
        dry_run: false,
    };

    #[tokio::test]
    async fn test_archive_is_created() {
        let store = fixtures::store().await;
        let mut instance = fixtures::instance(plans::AWS_PLAN_ID);
        instance.subscription_global_account_id = "subscription-ga".to_string();
        fixtures::seed_instance(&store, &instance).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        let step = ArchivingStep::new(store.clone(), ENABLED);

        let (op, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        let archived = store.get_instance_archived(INSTANCE_ID).await.unwrap();
        assert_eq!(archived.plan_name, "aws");
        assert_eq!(archived.provider, "AWS");
        assert_eq!(archived.subscription_global_account_id, "subscription-ga");
        assert!(archived.internal_user);
        assert_eq!(archived.last_runtime_id, fixtures::RUNTIME_ID);

        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(store.total_instances_archived().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_skipped_for_suspension_and_retrigger() {
        let store = fixtures::store().await;
        fixtures::seed_instance(&store, &fixtures::instance(plans::TRIAL_PLAN_ID)).await;
        let step = ArchivingStep::new(store.clone(), ENABLED);

        let mut suspension = fixtures::operation(plans::TRIAL_PLAN_ID);
        suspension.temporary = true;
        step.run(suspension).await.unwrap();

        let mut retrigger = fixtures::operation(plans::TRIAL_PLAN_ID);
        retrigger.executed_but_not_completed = vec!["EDP_Deregistration".to_string()];
        step.run(retrigger).await.unwrap();

        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_and_disabled_do_not_write() {
        let store = fixtures::store().await;
        fixtures::seed_instance(&store, &fixtures::instance(plans::AWS_PLAN_ID)).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;

        ArchivingStep::new(store.clone(), StepSwitch { enabled: true, dry_run: true })
            .run(op.clone())
            .await
            .unwrap();
        ArchivingStep::new(store.clone(), StepSwitch::default())
            .run(op)
            .await
            .unwrap();

        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
    }
}
