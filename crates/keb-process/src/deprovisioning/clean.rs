// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Last step: drop the operation log of the instance.

use std::sync::Arc;
use std::time::Duration;

use keb_core::Persistence;
use keb_core::model::Operation;
use tracing::{error, info};

use super::CLEAN_STEP;
use super::archiving::DB_RETRY_BACKOFF;
use crate::config::StepSwitch;
use crate::operation_manager::StepResult;
use crate::staged_manager::Step;

pub struct CleanStep {
    storage: Arc<dyn Persistence>,
    switch: StepSwitch,
}

impl CleanStep {
    pub fn new(storage: Arc<dyn Persistence>, switch: StepSwitch) -> Self {
        Self { storage, switch }
    }
}

#[async_trait::async_trait]
impl Step for CleanStep {
    fn name(&self) -> &str {
        CLEAN_STEP
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if !self.switch.enabled {
            return Ok((operation, Duration::ZERO));
        }
        if operation.temporary {
            info!("Suspension operation must not clean data");
            return Ok((operation, Duration::ZERO));
        }
        if !operation.executed_but_not_completed.is_empty() {
            info!("There are steps which need a retrigger, skipping");
            return Ok((operation, Duration::ZERO));
        }

        let operations = match self
            .storage
            .list_operations_by_instance_id(&operation.instance_id)
            .await
        {
            Ok(operations) => operations,
            Err(e) => {
                error!(error = %e, "Unable to list operations");
                return Ok((operation, DB_RETRY_BACKOFF));
            }
        };
        if self.switch.dry_run {
            info!(operations = operations.len(), "Dry run mode, skipping removal of operations");
            return Ok((operation, Duration::ZERO));
        }

        // Runtime states reference their operation.
        for op in &operations {
            info!(operation_id = %op.id, "Removing runtime states of operation");
            if let Err(e) = self.storage.delete_runtime_states_by_operation_id(&op.id).await {
                error!(error = %e, "Unable to delete runtime states");
                return Ok((operation, DB_RETRY_BACKOFF));
            }
        }
        for op in &operations {
            info!(operation_id = %op.id, "Removing operation");
            match self.storage.delete_operation(&op.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(operation_id = %op.id, error = %e, "Unable to delete operation");
                    return Ok((operation, DB_RETRY_BACKOFF));
                }
            }
        }
        info!(
            instance_id = %operation.instance_id,
            "All runtime states and operations of the instance have been deleted"
        );
        Ok((operation, Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures::{self, INSTANCE_ID, OPERATION_ID};
    use keb_core::model::RuntimeState;
    use keb_core::plans;

    const ENABLED: StepSwitch = StepSwitch {
        enabled: true,
        dry_run: false,
    };

    #[tokio::test]
    async fn test_operations_and_runtime_states_are_removed() {
        let store = fixtures::store().await;
        fixtures::seed_instance(&store, &fixtures::instance(plans::AWS_PLAN_ID)).await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        store
            .insert_runtime_state(&RuntimeState::new("state-1", fixtures::RUNTIME_ID, OPERATION_ID))
            .await
            .unwrap();
        let step = CleanStep::new(store.clone(), ENABLED);

        let (op, backoff) = step.run(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert!(store.list_operations_by_instance_id(INSTANCE_ID).await.unwrap().is_empty());
        assert!(
            store
                .list_runtime_states_by_operation_id(OPERATION_ID)
                .await
                .unwrap()
                .is_empty()
        );

        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_operations_are_kept_for_retrigger_and_dry_run() {
        let store = fixtures::store().await;
        fixtures::seed_instance(&store, &fixtures::instance(plans::AWS_PLAN_ID)).await;
        let mut op = fixtures::operation(plans::AWS_PLAN_ID);
        op.executed_but_not_completed = vec!["Release_Subscription".to_string()];
        let op = fixtures::insert(&store, &op).await;

        CleanStep::new(store.clone(), ENABLED).run(op.clone()).await.unwrap();
        let mut dry = op;
        dry.executed_but_not_completed.clear();
        CleanStep::new(store.clone(), StepSwitch { enabled: true, dry_run: true })
            .run(dry)
            .await
            .unwrap();

        assert_eq!(store.list_operations_by_instance_id(INSTANCE_ID).await.unwrap().len(), 2);
    }
}
