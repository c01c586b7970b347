// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations: one record per lifecycle intent acting on an instance.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::{InstanceDetails, ProvisioningParameters};

/// Kind of lifecycle intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Provision,
    /// Real deprovisioning, or a suspension when the operation is temporary.
    Deprovision,
    Update,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "update" => Ok(Self::Update),
            other => Err(other.to_string()),
        }
    }
}

/// Operation state machine: `Pending -> InProgress -> (Succeeded | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Succeeded or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// External system a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorComponent {
    #[default]
    #[serde(rename = "")]
    NotSet,
    #[serde(rename = "keb")]
    Keb,
    #[serde(rename = "db - keb")]
    KebDb,
    #[serde(rename = "provisioner")]
    Provisioner,
    #[serde(rename = "edp")]
    Edp,
    #[serde(rename = "lifecycle-manager")]
    LifecycleManager,
    #[serde(rename = "infrastructure-manager")]
    InfrastructureManager,
    #[serde(rename = "gardener")]
    Gardener,
    #[serde(rename = "btp-operator")]
    BtpOperator,
    #[serde(rename = "account-pool")]
    AccountPool,
}

impl ErrorComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSet => "",
            Self::Keb => "keb",
            Self::KebDb => "db - keb",
            Self::Provisioner => "provisioner",
            Self::Edp => "edp",
            Self::LifecycleManager => "lifecycle-manager",
            Self::InfrastructureManager => "infrastructure-manager",
            Self::Gardener => "gardener",
            Self::BtpOperator => "btp-operator",
            Self::AccountPool => "account-pool",
        }
    }
}

impl fmt::Display for ErrorComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure recorded on an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub reason: String,
    pub component: ErrorComponent,
    pub step: String,
}

/// One lifecycle intent. Updated only through version-checked writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub instance_id: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    /// Also the heartbeat of the running step.
    pub updated_at: DateTime<Utc>,
    pub operation_type: OperationType,
    pub state: OperationState,
    pub description: String,
    pub provisioning_parameters: ProvisioningParameters,
    pub instance_details: InstanceDetails,
    /// Stages already completed; skipped when the operation is resumed.
    pub finished_stages: Vec<String>,
    /// Suspension rather than real deprovisioning.
    pub temporary: bool,
    /// Steps that gave up without failing the operation, in order.
    pub executed_but_not_completed: Vec<String>,
    pub user_agent: String,
    pub kyma_template: String,
    pub last_error: Option<LastError>,
    /// `Some(true)`: the runtime is managed by infrastructure-manager only.
    /// `Some(false)`: the legacy provisioner owns it. `None`: unknown.
    pub kim_deprovisions_only: Option<bool>,
    pub provisioner_operation_id: String,
}

impl Operation {
    fn new(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        operation_type: OperationType,
        state: OperationState,
        parameters: ProvisioningParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            version: 0,
            created_at: now,
            updated_at: now,
            operation_type,
            state,
            description: String::new(),
            provisioning_parameters: parameters,
            instance_details: InstanceDetails::default(),
            finished_stages: Vec::new(),
            temporary: false,
            executed_but_not_completed: Vec::new(),
            user_agent: String::new(),
            kyma_template: String::new(),
            last_error: None,
            kim_deprovisions_only: None,
            provisioner_operation_id: String::new(),
        }
    }

    /// A provisioning operation, in progress.
    pub fn provisioning(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        parameters: ProvisioningParameters,
    ) -> Self {
        Self::new(
            id,
            instance_id,
            OperationType::Provision,
            OperationState::InProgress,
            parameters,
        )
    }

    /// A deprovisioning request as inserted at intake.
    pub fn deprovisioning(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        parameters: ProvisioningParameters,
    ) -> Self {
        Self::new(
            id,
            instance_id,
            OperationType::Deprovision,
            OperationState::Pending,
            parameters,
        )
    }

    /// A suspension: a temporary deprovisioning that keeps the instance.
    pub fn suspension(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        parameters: ProvisioningParameters,
    ) -> Self {
        let mut op = Self::deprovisioning(id, instance_id, parameters);
        op.temporary = true;
        op
    }

    pub fn plan_id(&self) -> &str {
        &self.provisioning_parameters.plan_id
    }

    pub fn runtime_id(&self) -> &str {
        &self.instance_details.runtime_id
    }

    pub fn global_account_id(&self) -> &str {
        self.provisioning_parameters
            .ers_context
            .global_account_id
            .as_deref()
            .unwrap_or("")
    }

    pub fn subaccount_id(&self) -> &str {
        if !self.instance_details.subaccount_id.is_empty() {
            return &self.instance_details.subaccount_id;
        }
        self.provisioning_parameters
            .ers_context
            .subaccount_id
            .as_deref()
            .unwrap_or("")
    }

    /// Whether the operation reached Succeeded or Failed.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a stage has been recorded as finished.
    pub fn is_stage_finished(&self, stage: &str) -> bool {
        self.finished_stages.iter().any(|s| s == stage)
    }

    /// Record a finished stage; no-op if already present.
    pub fn finish_stage(&mut self, stage: &str) {
        if !self.is_stage_finished(stage) {
            self.finished_stages.push(stage.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        for state in [
            OperationState::Pending,
            OperationState::InProgress,
            OperationState::Succeeded,
            OperationState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<OperationState>().unwrap(), state);
        }
        assert!("done".parse::<OperationState>().is_err());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::Pending.is_terminal());
    }

    #[test]
    fn test_suspension_is_temporary_deprovision() {
        let op = Operation::suspension("op", "inst", ProvisioningParameters::default());
        assert_eq!(op.operation_type, OperationType::Deprovision);
        assert_eq!(op.state, OperationState::Pending);
        assert!(op.temporary);
    }

    #[test]
    fn test_finish_stage_is_idempotent() {
        let mut op = Operation::deprovisioning("op", "inst", ProvisioningParameters::default());
        op.finish_stage("Init");
        op.finish_stage("Init");
        assert_eq!(op.finished_stages, vec!["Init".to_string()]);
        assert!(op.is_stage_finished("Init"));
    }

    #[test]
    fn test_error_component_serialization() {
        let err = LastError {
            message: "boom".to_string(),
            reason: "timeout".to_string(),
            component: ErrorComponent::KebDb,
            step: "Init".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["component"], "db - keb");
        let back: LastError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
