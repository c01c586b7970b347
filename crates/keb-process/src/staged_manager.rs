// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged execution of an operation's steps.
//!
//! An operation is processed as an ordered list of stages, each holding one or
//! more steps. A finished stage is recorded in `finished_stages`, so a resumed
//! operation continues where it stopped. A step asking for a backoff is run
//! again in place until `max_step_processing_time` is used up; after that the
//! operation is handed back to the caller with the backoff.

use std::sync::Arc;
use std::time::Duration;

use keb_core::Persistence;
use keb_core::model::{ErrorComponent, LastError, Operation, OperationState};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::operation_manager::{OperationManager, StepResult, since};

/// Backoff when the operation cannot be read.
const FETCH_BACKOFF: Duration = Duration::from_secs(3);

/// A unit of work in a pipeline.
///
/// Steps must be idempotent: running a step against its own post-state
/// returns a zero backoff and changes nothing.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, operation: Operation) -> StepResult;
}

/// Predicate deciding whether a step applies to an operation.
pub type StepCondition = fn(&Operation) -> bool;

struct StepWithCondition {
    step: Arc<dyn Step>,
    condition: Option<StepCondition>,
}

struct Stage {
    name: String,
    steps: Vec<StepWithCondition>,
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct StagedManagerConfig {
    /// How long a step is retried in place before the operation is requeued.
    pub max_step_processing_time: Duration,
    /// Total budget of an operation, measured from its creation.
    pub operation_timeout: Duration,
}

impl Default for StagedManagerConfig {
    fn default() -> Self {
        Self {
            max_step_processing_time: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(24 * 3600),
        }
    }
}

/// Runs operations through their stages.
pub struct StagedManager {
    storage: Arc<dyn Persistence>,
    stages: Vec<Stage>,
    config: StagedManagerConfig,
    speed_factor: u32,
}

impl StagedManager {
    pub fn new(storage: Arc<dyn Persistence>, config: StagedManagerConfig) -> Self {
        Self {
            storage,
            stages: Vec::new(),
            config,
            speed_factor: 1,
        }
    }

    /// Divide in-place retry sleeps by `factor`. Intended for tests.
    pub fn speed_up(&mut self, factor: u32) {
        self.speed_factor = factor.max(1);
    }

    /// Replace the stage list with empty stages named `names`.
    pub fn define_stages(&mut self, names: &[&str]) {
        self.stages = names
            .iter()
            .map(|name| Stage {
                name: name.to_string(),
                steps: Vec::new(),
            })
            .collect();
    }

    /// Append a step to a defined stage.
    pub fn add_step(
        &mut self,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
    ) -> Result<()> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .ok_or_else(|| Error::Other(format!("stage {stage} not defined")))?;
        stage.steps.push(StepWithCondition { step, condition });
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Process one operation as far as possible.
    ///
    /// Returns the delay after which the operation should be executed again,
    /// or zero when it needs no further processing.
    pub async fn execute(&self, operation_id: &str) -> Result<Duration> {
        let operation = match self.storage.get_operation(operation_id).await {
            Ok(op) => op,
            Err(e) => {
                error!(operation_id, error = %e, "Cannot fetch operation from storage");
                return Ok(FETCH_BACKOFF);
            }
        };
        if operation.is_finished() {
            return Ok(Duration::ZERO);
        }

        info!(
            operation_id,
            instance_id = %operation.instance_id,
            plan_id = %operation.plan_id(),
            global_account_id = %operation.global_account_id(),
            "Start processing operation steps"
        );

        if since(operation.created_at) > self.config.operation_timeout {
            return self.fail_on_timeout(operation).await;
        }

        let mut processed = operation;
        for stage in &self.stages {
            if processed.is_stage_finished(&stage.name) {
                continue;
            }

            for entry in &stage.steps {
                if let Some(condition) = entry.condition
                    && !condition(&processed)
                {
                    debug!(
                        operation_id,
                        step = entry.step.name(),
                        stage = %stage.name,
                        "Skipping"
                    );
                    continue;
                }

                let (op, when) = self.run_step(entry.step.as_ref(), processed).await?;
                processed = op;

                if processed.is_finished() {
                    info!(
                        operation_id,
                        state = %processed.state,
                        "Operation finished by step {}",
                        entry.step.name()
                    );
                    return Ok(Duration::ZERO);
                }
                if !when.is_zero() {
                    warn!(
                        operation_id,
                        step = entry.step.name(),
                        retry_in_secs = when.as_secs(),
                        "Retrying step by restarting the operation"
                    );
                    return Ok(when);
                }
            }

            processed.finish_stage(&stage.name);
            match self.storage.update_operation(&processed).await {
                Ok(stored) => {
                    info!(operation_id, stage = %stage.name, "Finished stage");
                    processed = stored;
                }
                // The final steps delete the operation row.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        operation_id,
                        stage = %stage.name,
                        error = %e,
                        "Unable to save operation with finished stage"
                    );
                    return Ok(Duration::from_secs(1));
                }
            }
        }

        processed.state = OperationState::Succeeded;
        processed.description = "Processing finished".to_string();
        match self.storage.update_operation(&processed).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(operation_id, error = %e, "Unable to save succeeded operation");
                return Ok(Duration::from_secs(1));
            }
        }

        info!(operation_id, instance_id = %processed.instance_id, "Operation succeeded");
        Ok(Duration::ZERO)
    }

    async fn fail_on_timeout(&self, mut operation: Operation) -> Result<Duration> {
        info!(
            operation_id = %operation.id,
            created_at = %operation.created_at,
            "Operation has reached the time limit"
        );
        operation.state = OperationState::Failed;
        operation.description = "operation has reached the time limit".to_string();
        operation.last_error = Some(LastError {
            message: "operation has reached the time limit".to_string(),
            reason: "operation has reached the time limit".to_string(),
            component: ErrorComponent::NotSet,
            step: String::new(),
        });

        let operation_id = operation.id.clone();
        if let Err(e) = self.storage.update_operation(&operation).await {
            warn!(
                operation_id = %operation_id,
                error = %e,
                "Unable to save operation that reached the time limit"
            );
            return Ok(Duration::from_secs(1));
        }
        Err(Error::OperationTimeout(operation_id))
    }

    #[instrument(
        skip(self, step, operation),
        fields(
            instance_id = %operation.instance_id,
            operation_id = %operation.id,
            step = %step.name()
        )
    )]
    async fn run_step(&self, step: &dyn Step, operation: Operation) -> Result<(Operation, Duration)> {
        let begin = tokio::time::Instant::now();
        let mut current = operation;

        loop {
            info!("Start step");
            let snapshot = current.clone();
            match step.run(current).await {
                Ok((op, backoff)) => {
                    if backoff.is_zero() || begin.elapsed() >= self.config.max_step_processing_time {
                        return Ok((op, backoff));
                    }
                    debug!(sleep_secs = backoff.as_secs_f64(), "Step sleeping before retry");
                    tokio::time::sleep(backoff / self.speed_factor).await;
                    current = op;
                }
                Err(e) => {
                    let failed = match &e {
                        crate::error::StepError::OperationFailed { operation, .. } => {
                            operation.as_ref().clone()
                        }
                        crate::error::StepError::Storage { .. } => snapshot,
                    };
                    warn!(
                        error_component = %e.component(),
                        error_reason = %e.reason(),
                        "Last error from step"
                    );
                    OperationManager::new(self.storage.clone(), step.name(), e.component())
                        .record_last_error(&failed, &e)
                        .await;
                    error!(error = %e, "Last error that terminated the step");
                    return Err(e.into());
                }
            }
        }
    }
}
