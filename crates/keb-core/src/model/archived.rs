// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable summaries of deprovisioned instances.
//!
//! An archive row is synthesized from the operation log of an instance:
//!
//! - the first operation (by `created_at`) must be the provisioning; it
//!   provides the plan, the instance id and the provisioning timestamps,
//! - when more operations exist, the chronologically last one provides the
//!   account ids, shoot name, region and last runtime id,
//! - the first non-temporary deprovisioning provides the first-deprovisioning
//!   timestamps.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::instance::{INTERNAL_USER_DOMAIN, Instance};
use super::operation::{Operation, OperationState, OperationType};
use crate::plans;

/// Reasons an operation log cannot be summarized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    #[error("operations cannot be empty")]
    NoOperations,
    #[error("first operation must be provision, but was {0}")]
    FirstNotProvision(OperationType),
}

/// Historical summary of a deprovisioned instance.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InstanceArchived {
    pub instance_id: String,
    pub global_account_id: String,
    pub subaccount_id: String,
    pub subscription_global_account_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub subaccount_region: String,
    pub region: String,
    pub provider: String,
    pub last_runtime_id: String,
    pub internal_user: bool,
    pub shoot_name: String,
    pub provisioning_started_at: DateTime<Utc>,
    pub provisioning_finished_at: DateTime<Utc>,
    pub provisioning_state: String,
    pub first_deprovisioning_started_at: Option<DateTime<Utc>>,
    pub first_deprovisioning_finished_at: Option<DateTime<Utc>>,
    pub last_deprovisioning_finished_at: Option<DateTime<Utc>>,
}

impl InstanceArchived {
    /// Summarize an operation log.
    pub fn from_operations(operations: &[Operation]) -> Result<Self, ArchiveError> {
        let mut ordered: Vec<&Operation> = operations.iter().collect();
        ordered.sort_by_key(|op| op.created_at);

        let (provisioning, rest) = ordered.split_first().ok_or(ArchiveError::NoOperations)?;
        if provisioning.operation_type != OperationType::Provision {
            return Err(ArchiveError::FirstNotProvision(provisioning.operation_type));
        }

        let params = &provisioning.provisioning_parameters;
        let mut archived = Self {
            instance_id: provisioning.instance_id.clone(),
            global_account_id: String::new(),
            subaccount_id: String::new(),
            subscription_global_account_id: String::new(),
            plan_id: params.plan_id.clone(),
            plan_name: plans::plan_name(&params.plan_id).to_string(),
            subaccount_region: params.platform_region.clone(),
            region: String::new(),
            provider: String::new(),
            last_runtime_id: String::new(),
            internal_user: params.ers_context.user_id().contains(INTERNAL_USER_DOMAIN),
            shoot_name: String::new(),
            provisioning_started_at: provisioning.created_at,
            provisioning_finished_at: provisioning.updated_at,
            provisioning_state: provisioning.state.as_str().to_string(),
            first_deprovisioning_started_at: None,
            first_deprovisioning_finished_at: None,
            last_deprovisioning_finished_at: None,
        };

        if let Some(last) = rest.last() {
            archived.subaccount_id = last.subaccount_id().to_string();
            archived.global_account_id = last.global_account_id().to_string();
            archived.shoot_name = last.instance_details.shoot_name.clone();
            archived.region = last.instance_details.region.clone();
            archived.last_runtime_id = last.runtime_id().to_string();
            archived.last_deprovisioning_finished_at = Some(last.updated_at);
        }

        if let Some(first) = ordered
            .iter()
            .find(|op| op.operation_type == OperationType::Deprovision && !op.temporary)
        {
            archived.first_deprovisioning_started_at = Some(first.created_at);
            archived.first_deprovisioning_finished_at = Some(first.updated_at);
        }

        Ok(archived)
    }

    /// Summarize an operation log while the instance row is still readable.
    pub fn from_instance_and_operations(
        instance: &Instance,
        operations: &[Operation],
    ) -> Result<Self, ArchiveError> {
        let mut archived = Self::from_operations(operations)?;
        archived.provider = instance.provider.clone();
        archived.subscription_global_account_id = instance.subscription_global_account_id.clone();
        Ok(archived)
    }

    /// Whether provisioning of the archived instance succeeded.
    pub fn provisioning_succeeded(&self) -> bool {
        self.provisioning_state == OperationState::Succeeded.as_str()
    }
}
