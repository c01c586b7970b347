// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker driving deprovisioning operations.
//!
//! The worker polls storage for unfinished deprovisioning operations and runs
//! each through the pipeline on a bounded pool of tasks. An operation that
//! asks for a backoff is not picked up again before the backoff has passed.
//! Different processes may run the worker against the same database; the
//! version check on operation updates keeps them from clobbering each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use keb_core::Persistence;
use keb_core::model::OperationType;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::staged_manager::StagedManager;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Operations processed at the same time.
    pub workers: usize,
    /// How often storage is polled for operations.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            poll_interval: Duration::from_secs(5),
        }
    }
}

type TaskOutcome = (String, Result<Duration>);

/// Bookkeeping of dispatched operations.
#[derive(Default)]
struct Schedule {
    in_flight: HashSet<String>,
    not_before: HashMap<String, Instant>,
}

impl Schedule {
    fn is_due(&self, operation_id: &str, now: Instant) -> bool {
        !self.in_flight.contains(operation_id)
            && self
                .not_before
                .get(operation_id)
                .is_none_or(|at| *at <= now)
    }

    fn complete(&mut self, (operation_id, outcome): TaskOutcome) {
        self.in_flight.remove(&operation_id);
        match outcome {
            Ok(backoff) if backoff.is_zero() => {
                self.not_before.remove(&operation_id);
            }
            Ok(backoff) => {
                debug!(operation_id = %operation_id, retry_in_secs = backoff.as_secs(), "Operation requeued");
                self.not_before.insert(operation_id, Instant::now() + backoff);
            }
            Err(e) => {
                warn!(operation_id = %operation_id, error = %e, "Operation processing ended with an error");
                self.not_before.remove(&operation_id);
            }
        }
    }
}

/// Runs the deprovisioning pipeline for pending operations.
pub struct DeprovisioningWorker {
    storage: Arc<dyn Persistence>,
    pipeline: Arc<StagedManager>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl DeprovisioningWorker {
    pub fn new(storage: Arc<dyn Persistence>, pipeline: StagedManager, config: WorkerConfig) -> Self {
        Self {
            storage,
            pipeline: Arc::new(pipeline),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown is signalled, then wait for the
    /// operations in flight.
    pub async fn run(self) {
        info!(
            workers = self.config.workers,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Deprovisioning worker started"
        );

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut schedule = Schedule::default();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Deprovisioning worker received shutdown signal");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => schedule.complete(outcome),
                        Err(e) => error!(error = %e, "Deprovisioning task panicked"),
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.dispatch(&permits, &mut tasks, &mut schedule).await {
                        error!(error = %e, "Failed to dispatch deprovisioning operations");
                    }
                }
            }
        }

        let remaining = tasks.len();
        if remaining > 0 {
            info!(remaining, "Waiting for operations in flight");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Deprovisioning task panicked");
            }
        }
        info!("Deprovisioning worker stopped");
    }

    /// Start every due operation a permit is free for.
    async fn dispatch(
        &self,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskOutcome>,
        schedule: &mut Schedule,
    ) -> Result<()> {
        let operations = self
            .storage
            .list_not_finished_operations_by_type(OperationType::Deprovision)
            .await?;
        if operations.is_empty() {
            debug!("No deprovisioning operations to process");
            return Ok(());
        }

        let now = Instant::now();
        let listed: HashSet<&str> = operations.iter().map(|op| op.id.as_str()).collect();
        schedule
            .not_before
            .retain(|id, _| listed.contains(id.as_str()));

        for operation in &operations {
            if !schedule.is_due(&operation.id, now) {
                continue;
            }
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                debug!("All workers busy");
                break;
            };

            let operation_id = operation.id.clone();
            schedule.in_flight.insert(operation_id.clone());
            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = pipeline.execute(&operation_id).await;
                (operation_id, outcome)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deprovisioning::fixtures;
    use crate::operation_manager::StepResult;
    use crate::staged_manager::{StagedManagerConfig, Step};
    use keb_core::model::{Operation, OperationState};
    use keb_core::plans;

    struct Noop;

    #[async_trait::async_trait]
    impl Step for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, operation: Operation) -> StepResult {
            Ok((operation, Duration::ZERO))
        }
    }

    #[test]
    fn test_schedule_respects_backoff() {
        let mut schedule = Schedule::default();
        let now = Instant::now();
        assert!(schedule.is_due("op", now));

        schedule.in_flight.insert("op".to_string());
        assert!(!schedule.is_due("op", now));

        schedule.complete(("op".to_string(), Ok(Duration::from_secs(60))));
        assert!(!schedule.is_due("op", Instant::now()));
        assert!(schedule.is_due("op", Instant::now() + Duration::from_secs(61)));

        schedule.complete(("op".to_string(), Ok(Duration::ZERO)));
        assert!(schedule.is_due("op", Instant::now()));
    }

    #[tokio::test]
    async fn test_worker_processes_pending_operations() {
        let store = fixtures::store().await;
        let op = fixtures::insert(&store, &fixtures::operation(plans::AWS_PLAN_ID)).await;
        let mut pipeline = StagedManager::new(store.clone(), StagedManagerConfig::default());
        pipeline.define_stages(&["noop"]);
        pipeline.add_step("noop", Arc::new(Noop), None).unwrap();

        let worker = DeprovisioningWorker::new(
            store.clone(),
            pipeline,
            WorkerConfig {
                workers: 2,
                poll_interval: Duration::from_millis(10),
            },
        );
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stored = store.get_operation(&op.id).await.unwrap();
            if stored.state == OperationState::Succeeded {
                break;
            }
            assert!(Instant::now() < deadline, "operation was not processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
