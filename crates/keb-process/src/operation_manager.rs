// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation bookkeeping shared by pipeline steps.
//!
//! Every helper returns a [`StepResult`] so a step can hand its outcome
//! straight back to the runner:
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Ok((op, Duration::ZERO))` | continue with the next step |
//! | `Ok((op, backoff))` | run this step again after `backoff` |
//! | `Err(StepError)` | the operation is finished (failed) |
//!
//! Retries are bounded by wall-clock time measured from the operation's
//! `updated_at`, never by attempt counts.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keb_core::Persistence;
use keb_core::model::{ErrorComponent, LastError, Operation, OperationState};
use tracing::{error, info, warn};

use crate::error::StepError;

/// Outcome of a step: the current operation and a requeue delay.
pub type StepResult = Result<(Operation, Duration), StepError>;

/// Underlying error of a retry or failure, if any.
pub type Cause<'a> = Option<&'a (dyn Display + Sync)>;

/// Backoff after a conflict that a fresh read could not resolve.
const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff after any other storage failure.
const STORAGE_BACKOFF: Duration = Duration::from_secs(60);

/// Time elapsed since `at`, zero if `at` is in the future.
pub fn since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or(Duration::ZERO)
}

/// Operation updates on behalf of one step.
///
/// Failures recorded through the manager are attributed to its step name and
/// component.
#[derive(Clone)]
pub struct OperationManager {
    storage: Arc<dyn Persistence>,
    step: String,
    component: ErrorComponent,
}

impl OperationManager {
    pub fn new(
        storage: Arc<dyn Persistence>,
        step: impl Into<String>,
        component: ErrorComponent,
    ) -> Self {
        Self {
            storage,
            step: step.into(),
            component,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Persistence> {
        &self.storage
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Apply `mutate` and store the result.
    ///
    /// On a version conflict the operation is read again and `mutate` applied
    /// once more. If that fails too, the unmodified `operation` is returned
    /// with a one-second backoff; other storage failures back off for a
    /// minute. The returned delay is zero only when the update was stored.
    pub async fn update_operation<F>(&self, operation: Operation, mutate: F) -> (Operation, Duration)
    where
        F: Fn(&mut Operation) + Send + Sync,
    {
        let mut updated = operation.clone();
        mutate(&mut updated);

        match self.storage.update_operation(&updated).await {
            Ok(stored) => (stored, Duration::ZERO),
            Err(e) if e.is_conflict() => {
                let mut fresh = match self.storage.get_operation(&operation.id).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        warn!(
                            operation_id = %operation.id,
                            step = %self.step,
                            error = %e,
                            "Unable to re-read operation after conflict"
                        );
                        return (operation, CONFLICT_BACKOFF);
                    }
                };
                mutate(&mut fresh);
                match self.storage.update_operation(&fresh).await {
                    Ok(stored) => (stored, Duration::ZERO),
                    Err(e) => {
                        warn!(
                            operation_id = %operation.id,
                            step = %self.step,
                            error = %e,
                            "Unable to update operation after conflict"
                        );
                        (operation, CONFLICT_BACKOFF)
                    }
                }
            }
            Err(e) => {
                error!(
                    operation_id = %operation.id,
                    step = %self.step,
                    error = %e,
                    error_kind = %e.kind(),
                    "Unable to update operation"
                );
                (operation, STORAGE_BACKOFF)
            }
        }
    }

    /// Mark the operation `Failed`, store it and end the pipeline.
    ///
    /// If the failure cannot be stored the step is retried instead.
    pub async fn operation_failed(
        &self,
        operation: Operation,
        reason: &str,
        cause: Cause<'_>,
    ) -> StepResult {
        let message = cause.map(ToString::to_string).unwrap_or_default();
        let last_error = LastError {
            message: message.clone(),
            reason: reason.to_string(),
            component: self.component,
            step: self.step.clone(),
        };

        let (stored, backoff) = self
            .update_operation(operation, |op| {
                op.state = OperationState::Failed;
                op.description = reason.to_string();
                op.last_error = Some(last_error.clone());
            })
            .await;
        if !backoff.is_zero() {
            return Ok((stored, backoff));
        }

        error!(
            operation_id = %stored.id,
            instance_id = %stored.instance_id,
            step = %self.step,
            error_component = %self.component,
            error_reason = reason,
            error = %message,
            "Operation failed"
        );

        Err(StepError::OperationFailed {
            operation: Box::new(stored),
            step: self.step.clone(),
            component: self.component,
            reason: if message.is_empty() {
                reason.to_string()
            } else {
                format!("{reason}: {message}")
            },
        })
    }

    /// Retry until `max_time` has passed since the last update, then fail.
    pub async fn retry_operation(
        &self,
        operation: Operation,
        reason: &str,
        cause: Cause<'_>,
        interval: Duration,
        max_time: Duration,
    ) -> StepResult {
        if since(operation.updated_at) < max_time {
            warn!(
                operation_id = %operation.id,
                step = %self.step,
                retry_in_secs = interval.as_secs_f64(),
                error = %display_cause(cause),
                "{reason}, retrying"
            );
            return Ok((operation, interval));
        }
        self.operation_failed(operation, reason, cause).await
    }

    /// Retry once after `interval`; fail if the operation was last updated
    /// longer ago than that.
    pub async fn retry_operation_once(
        &self,
        operation: Operation,
        reason: &str,
        cause: Cause<'_>,
        interval: Duration,
    ) -> StepResult {
        if since(operation.updated_at) < interval {
            warn!(
                operation_id = %operation.id,
                step = %self.step,
                error = %display_cause(cause),
                "{reason}, retrying once"
            );
            return Ok((operation, interval));
        }
        self.operation_failed(operation, reason, cause).await
    }

    /// Retry until `max_time`, then record `step_name` as executed but not
    /// completed and let the pipeline continue.
    pub async fn retry_operation_without_fail(
        &self,
        operation: Operation,
        step_name: &str,
        description: &str,
        interval: Duration,
        max_time: Duration,
        cause: Cause<'_>,
    ) -> StepResult {
        if since(operation.updated_at) < max_time {
            warn!(
                operation_id = %operation.id,
                step = step_name,
                retry_in_secs = interval.as_secs_f64(),
                error = %display_cause(cause),
                "{description}, retrying"
            );
            return Ok((operation, interval));
        }
        self.mark_step_as_executed_but_not_completed(operation, step_name, description)
            .await
    }

    /// Record that `step_name` gave up without failing the operation.
    pub async fn mark_step_as_executed_but_not_completed(
        &self,
        operation: Operation,
        step_name: &str,
        description: &str,
    ) -> StepResult {
        warn!(
            operation_id = %operation.id,
            instance_id = %operation.instance_id,
            step = step_name,
            "{description}, marking step as executed but not completed"
        );
        let (stored, backoff) = self
            .update_operation(operation, |op| {
                if !op.executed_but_not_completed.iter().any(|s| s == step_name) {
                    op.executed_but_not_completed.push(step_name.to_string());
                }
                op.description = description.to_string();
            })
            .await;
        Ok((stored, backoff))
    }

    /// Store a step's last error without changing the operation state.
    pub(crate) async fn record_last_error(&self, operation: &Operation, err: &StepError) {
        let mut updated = operation.clone();
        updated.last_error = Some(LastError {
            message: err.to_string(),
            reason: err.reason(),
            component: err.component(),
            step: err.step().to_string(),
        });
        if let Err(e) = self.storage.update_operation(&updated).await {
            if !e.is_not_found() {
                warn!(
                    operation_id = %operation.id,
                    step = %self.step,
                    error = %e,
                    "Unable to save the last error of the step"
                );
            }
        } else {
            info!(
                operation_id = %operation.id,
                step = %self.step,
                error_component = %err.component(),
                "Saved the last error of the step"
            );
        }
    }
}

fn display_cause(cause: Cause<'_>) -> String {
    cause.map(ToString::to_string).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keb_core::FieldCipher;
    use keb_core::model::ProvisioningParameters;
    use keb_core::persistence::SqlitePersistence;

    async fn setup() -> (Arc<dyn Persistence>, Operation) {
        let store: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory(FieldCipher::disabled())
                .await
                .unwrap(),
        );
        let op = Operation::deprovisioning("op-1", "inst-1", ProvisioningParameters::default());
        store.insert_operation(&op).await.unwrap();
        let op = store.get_operation("op-1").await.unwrap();
        (store, op)
    }

    #[tokio::test]
    async fn test_update_operation_bumps_version() {
        let (store, op) = setup().await;
        let manager = OperationManager::new(store.clone(), "some_step", ErrorComponent::Keb);

        let (updated, backoff) = manager
            .update_operation(op.clone(), |op| op.description = "changed".to_string())
            .await;

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(updated.version, op.version + 1);
        assert_eq!(store.get_operation("op-1").await.unwrap().description, "changed");
    }

    #[tokio::test]
    async fn test_update_operation_recovers_from_conflict() {
        let (store, op) = setup().await;
        let manager = OperationManager::new(store.clone(), "some_step", ErrorComponent::Keb);

        // Someone else updates the row first.
        let mut other = op.clone();
        other.user_agent = "other-writer".to_string();
        store.update_operation(&other).await.unwrap();

        let (updated, backoff) = manager
            .update_operation(op, |op| op.description = "mine".to_string())
            .await;

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(updated.description, "mine");
        assert_eq!(updated.user_agent, "other-writer");
    }

    #[tokio::test]
    async fn test_update_missing_operation_backs_off() {
        let (store, mut op) = setup().await;
        let manager = OperationManager::new(store, "some_step", ErrorComponent::Keb);
        op.id = "missing".to_string();

        let (returned, backoff) = manager
            .update_operation(op, |op| op.description = "x".to_string())
            .await;
        assert!(backoff > Duration::ZERO);
        assert_eq!(returned.description, "");
    }

    #[tokio::test]
    async fn test_retry_operation_once() {
        let (store, op) = setup().await;
        let manager = OperationManager::new(store, "some_step", ErrorComponent::Provisioner);
        let interval = Duration::from_secs(3600);

        let (mut op, when) = manager
            .retry_operation_once(op, "ups", None, interval)
            .await
            .unwrap();
        assert!(when > Duration::ZERO);

        op.updated_at -= chrono::Duration::seconds(3601);
        let err = manager
            .retry_operation_once(op, "ups", None, interval)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn test_retry_operation_within_max_time() {
        let (store, op) = setup().await;
        let manager = OperationManager::new(store, "some_step", ErrorComponent::NotSet);
        let interval = Duration::from_secs(3600);
        let max_time = Duration::from_secs(3 * 3600);

        let (mut op, when) = manager
            .retry_operation(op, "ups", None, interval, max_time)
            .await
            .unwrap();
        assert!(when > Duration::ZERO);

        op.updated_at -= chrono::Duration::seconds(3601);
        let (_, when) = manager
            .retry_operation(op, "ups", None, interval, max_time)
            .await
            .unwrap();
        assert!(when > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_without_fail_marks_step() {
        let (store, mut op) = setup().await;
        let manager = OperationManager::new(store.clone(), "some_step", ErrorComponent::Keb);
        op.updated_at -= chrono::Duration::minutes(5);

        let (op, when) = manager
            .retry_operation_without_fail(
                op,
                "some_step",
                "could not do it",
                Duration::from_secs(1),
                Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();

        assert_eq!(when, Duration::ZERO);
        assert_eq!(op.executed_but_not_completed, vec!["some_step".to_string()]);
        assert_eq!(op.state, OperationState::Pending);

        let stored = store.get_operation("op-1").await.unwrap();
        assert_eq!(stored.executed_but_not_completed, vec!["some_step".to_string()]);
    }

    #[tokio::test]
    async fn test_operation_failed_sets_last_error() {
        let cases: [(ErrorComponent, &str, Option<&str>, &str, &str); 4] = [
            (ErrorComponent::Provisioner, "friendly message", Some("technical err"), "provisioner", "technical err"),
            (ErrorComponent::KebDb, "friendly message", Some("technical err"), "db - keb", "technical err"),
            (ErrorComponent::Provisioner, "friendly message", None, "provisioner", ""),
            (ErrorComponent::Provisioner, "", Some("technical err"), "provisioner", "technical err"),
        ];

        for (component, reason, cause, expected_component, expected_message) in cases {
            let (store, op) = setup().await;
            let manager = OperationManager::new(store.clone(), "some_step", component);
            let cause = cause.map(|c| c.to_string());

            let err = manager
                .operation_failed(op, reason, cause.as_ref().map(|c| c as &(dyn Display + Sync)))
                .await
                .unwrap_err();

            let StepError::OperationFailed { operation, .. } = err else {
                panic!("expected OperationFailed");
            };
            let last_error = operation.last_error.unwrap();
            assert_eq!(operation.state, OperationState::Failed);
            assert_eq!(last_error.component.as_str(), expected_component);
            assert_eq!(last_error.message, expected_message);
            assert_eq!(last_error.reason, reason);
            assert_eq!(last_error.step, "some_step");

            let stored = store.get_operation("op-1").await.unwrap();
            assert_eq!(stored.state, OperationState::Failed);
        }
    }
}
