//! Persistence interfaces and backends for keb-core.
//!
//! The [`Persistence`] trait is the only storage seam. Reads that find no row
//! return [`StorageError::NotFound`], duplicate inserts return
//! [`StorageError::AlreadyExists`] and version mismatches on update return
//! [`StorageError::Conflict`]. Backends seal credential-carrying columns with a
//! [`FieldCipher`] before writing and open them on read.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::FieldCipher;
use crate::error::{Result, StorageError};
use crate::model::{
    Instance, InstanceArchived, InstanceDetails, LastError, Operation, OperationState,
    OperationType, ProvisioningParameters, RuntimeState,
};

// ============================================================================
// Filters and statistics
// ============================================================================

/// Filter for [`Persistence::list_instances`]. Empty lists do not filter.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Restrict to these instance ids.
    pub instance_ids: Vec<String>,
    /// Restrict to these plan ids.
    pub plan_ids: Vec<String>,
    /// Restrict to these subaccounts.
    pub subaccount_ids: Vec<String>,
    /// Restrict to these global accounts.
    pub global_account_ids: Vec<String>,
    /// Restrict to these runtimes.
    pub runtime_ids: Vec<String>,
    /// `Some(true)`: only soft-deleted instances; `Some(false)`: only live ones.
    pub deletion_attempted: Option<bool>,
}

/// Counts of removed instances whose operation log has not been archived yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedInstancesStatistics {
    /// Distinct instance ids still owning operations.
    pub instances: i64,
    /// Operations owned by those instance ids.
    pub operations: i64,
}

// ============================================================================
// Trait
// ============================================================================

/// Storage for the four entity families.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    // ----- instances -----

    /// Fetch an instance by id.
    async fn get_instance(&self, instance_id: &str) -> Result<Instance>;

    /// Insert a new instance.
    async fn insert_instance(&self, instance: &Instance) -> Result<()>;

    /// Version-checked update. Returns the stored instance with its new version.
    async fn update_instance(&self, instance: &Instance) -> Result<Instance>;

    /// Hard-delete an instance.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    /// List instances matching a filter, with `reconcilable` computed.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;

    /// Ids of removed instances that still own operation rows.
    async fn list_deleted_instance_ids(&self, limit: i64) -> Result<Vec<String>>;

    /// Counts of removed-but-not-archived instances and their operations.
    async fn deleted_instances_statistics(&self) -> Result<DeletedInstancesStatistics>;

    // ----- operations -----

    /// Insert a new operation.
    async fn insert_operation(&self, operation: &Operation) -> Result<()>;

    /// Version-checked update. Returns the stored operation with its new
    /// version and `updated_at`.
    async fn update_operation(&self, operation: &Operation) -> Result<Operation>;

    /// Fetch an operation by id.
    async fn get_operation(&self, operation_id: &str) -> Result<Operation>;

    /// Most recent operation of an instance that has left `Pending`.
    async fn get_last_operation(&self, instance_id: &str) -> Result<Operation>;

    /// All operations of an instance, oldest first.
    async fn list_operations_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>>;

    /// Pending or in-progress operations of a type, oldest first.
    async fn list_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>>;

    /// Delete an operation. Its runtime states must be gone already.
    async fn delete_operation(&self, operation_id: &str) -> Result<()>;

    // ----- runtime states -----

    /// Insert a runtime state.
    async fn insert_runtime_state(&self, state: &RuntimeState) -> Result<()>;

    /// Runtime states of an operation, oldest first.
    async fn list_runtime_states_by_operation_id(
        &self,
        operation_id: &str,
    ) -> Result<Vec<RuntimeState>>;

    /// Delete every runtime state of an operation. Missing rows are not an error.
    async fn delete_runtime_states_by_operation_id(&self, operation_id: &str) -> Result<()>;

    // ----- archive -----

    /// Insert an archive row; duplicates fail with `AlreadyExists`.
    async fn insert_instance_archived(&self, archived: &InstanceArchived) -> Result<()>;

    /// Fetch an archive row.
    async fn get_instance_archived(&self, instance_id: &str) -> Result<InstanceArchived>;

    /// Number of archive rows.
    async fn total_instances_archived(&self) -> Result<i64>;
}

// ============================================================================
// Record types
// ============================================================================

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub runtime_id: String,
    pub global_account_id: String,
    pub subscription_global_account_id: String,
    pub sub_account_id: String,
    pub service_id: String,
    pub service_plan_id: String,
    pub service_plan_name: String,
    pub provider: String,
    pub provider_region: String,
    pub provisioning_parameters: String,
    pub instance_details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub version: i32,
    /// Type of the most recent operation, if any.
    #[sqlx(default)]
    pub last_operation_type: Option<String>,
    /// State of the most recent operation, if any.
    #[sqlx(default)]
    pub last_operation_state: Option<String>,
}

impl InstanceRecord {
    /// Decode into the domain type, opening encrypted columns.
    pub fn into_instance(self, cipher: &FieldCipher) -> Result<Instance> {
        let reconcilable = !self.runtime_id.is_empty()
            && match (&self.last_operation_type, &self.last_operation_state) {
                (Some(kind), Some(state)) => {
                    kind != OperationType::Deprovision.as_str()
                        && parse_state(state)?.is_terminal()
                }
                _ => false,
            };

        Ok(Instance {
            parameters: open_parameters(cipher, &self.provisioning_parameters)?,
            instance_details: open_details(cipher, &self.instance_details)?,
            instance_id: self.instance_id,
            runtime_id: self.runtime_id,
            global_account_id: self.global_account_id,
            subscription_global_account_id: self.subscription_global_account_id,
            subaccount_id: self.sub_account_id,
            service_id: self.service_id,
            service_plan_id: self.service_plan_id,
            service_plan_name: self.service_plan_name,
            provider: self.provider,
            provider_region: self.provider_region,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            expired_at: self.expired_at,
            reconcilable,
            version: self.version,
        })
    }
}

/// Operation row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    pub id: String,
    pub instance_id: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(rename = "type")]
    pub operation_type: String,
    pub state: String,
    pub description: String,
    pub provisioning_parameters: String,
    pub instance_details: String,
    pub data: String,
    pub finished_stages: String,
}

/// Step bookkeeping kept in the `data` column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct OperationData {
    #[serde(default)]
    temporary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    executed_but_not_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    kyma_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<LastError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kim_deprovisions_only: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    provisioner_operation_id: String,
}

impl OperationRecord {
    /// Decode into the domain type, opening encrypted columns.
    pub fn into_operation(self, cipher: &FieldCipher) -> Result<Operation> {
        let operation_type =
            self.operation_type
                .parse::<OperationType>()
                .map_err(|value| StorageError::InvalidValue {
                    field: "type",
                    value,
                })?;
        let data: OperationData = if self.data.is_empty() {
            OperationData::default()
        } else {
            serde_json::from_str(&self.data)?
        };
        let finished_stages: Vec<String> = if self.finished_stages.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.finished_stages)?
        };

        Ok(Operation {
            state: parse_state(&self.state)?,
            provisioning_parameters: open_parameters(cipher, &self.provisioning_parameters)?,
            instance_details: open_details(cipher, &self.instance_details)?,
            id: self.id,
            instance_id: self.instance_id,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            operation_type,
            description: self.description,
            finished_stages,
            temporary: data.temporary,
            executed_but_not_completed: data.executed_but_not_completed,
            user_agent: data.user_agent,
            kyma_template: data.kyma_template,
            last_error: data.last_error,
            kim_deprovisions_only: data.kim_deprovisions_only,
            provisioner_operation_id: data.provisioner_operation_id,
        })
    }
}

/// Runtime state row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuntimeStateRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub runtime_id: String,
    pub operation_id: String,
    pub kyma_config: String,
    pub cluster_config: String,
    pub k8s_version: String,
}

impl RuntimeStateRecord {
    /// Decode into the domain type, opening the kyma config.
    pub fn into_runtime_state(self, cipher: &FieldCipher) -> Result<RuntimeState> {
        Ok(RuntimeState {
            kyma_config: cipher.decrypt(&self.kyma_config)?,
            id: self.id,
            created_at: self.created_at,
            runtime_id: self.runtime_id,
            operation_id: self.operation_id,
            cluster_config: self.cluster_config,
            k8s_version: self.k8s_version,
        })
    }
}

// ============================================================================
// Column encoding shared by the backends
// ============================================================================

/// Text columns of an instance, ready for binding.
pub(crate) struct SealedInstance {
    pub parameters: String,
    pub details: String,
}

impl SealedInstance {
    pub(crate) fn seal(instance: &Instance, cipher: &FieldCipher) -> Result<Self> {
        Ok(Self {
            parameters: seal_parameters(cipher, &instance.parameters)?,
            details: seal_details(cipher, &instance.instance_details)?,
        })
    }
}

/// Text columns of an operation, ready for binding.
pub(crate) struct SealedOperation {
    pub parameters: String,
    pub details: String,
    pub data: String,
    pub finished_stages: String,
}

impl SealedOperation {
    pub(crate) fn seal(operation: &Operation, cipher: &FieldCipher) -> Result<Self> {
        let data = OperationData {
            temporary: operation.temporary,
            executed_but_not_completed: operation.executed_but_not_completed.clone(),
            user_agent: operation.user_agent.clone(),
            kyma_template: operation.kyma_template.clone(),
            last_error: operation.last_error.clone(),
            kim_deprovisions_only: operation.kim_deprovisions_only,
            provisioner_operation_id: operation.provisioner_operation_id.clone(),
        };
        Ok(Self {
            parameters: seal_parameters(cipher, &operation.provisioning_parameters)?,
            details: seal_details(cipher, &operation.instance_details)?,
            data: serde_json::to_string(&data)?,
            finished_stages: serde_json::to_string(&operation.finished_stages)?,
        })
    }
}

fn parse_state(value: &str) -> Result<OperationState> {
    value
        .parse::<OperationState>()
        .map_err(|value| StorageError::InvalidValue {
            field: "state",
            value,
        })
}

fn seal_parameters(cipher: &FieldCipher, parameters: &ProvisioningParameters) -> Result<String> {
    let json = serde_json::to_string(parameters)?;
    Ok(cipher.encrypt(&json)?)
}

fn open_parameters(cipher: &FieldCipher, stored: &str) -> Result<ProvisioningParameters> {
    let json = cipher.decrypt(stored)?;
    if json.is_empty() {
        return Ok(ProvisioningParameters::default());
    }
    Ok(serde_json::from_str(&json)?)
}

fn seal_details(cipher: &FieldCipher, details: &InstanceDetails) -> Result<String> {
    let mut sealed = details.clone();
    sealed.kubeconfig = cipher.encrypt(&details.kubeconfig)?;
    Ok(serde_json::to_string(&sealed)?)
}

fn open_details(cipher: &FieldCipher, stored: &str) -> Result<InstanceDetails> {
    if stored.is_empty() {
        return Ok(InstanceDetails::default());
    }
    let mut details: InstanceDetails = serde_json::from_str(stored)?;
    details.kubeconfig = cipher.decrypt(&details.kubeconfig)?;
    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_kubeconfig_is_sealed() {
        let cipher = FieldCipher::new("secret");
        let details = InstanceDetails {
            runtime_id: "rt".to_string(),
            kubeconfig: "apiVersion: v1".to_string(),
            ..Default::default()
        };

        let stored = seal_details(&cipher, &details).unwrap();
        assert!(!stored.contains("apiVersion: v1"));
        assert!(stored.contains("\"runtime_id\":\"rt\""));
        assert_eq!(open_details(&cipher, &stored).unwrap(), details);
    }

    #[test]
    fn test_empty_columns_decode_to_defaults() {
        let cipher = FieldCipher::new("secret");
        assert_eq!(
            open_parameters(&cipher, "").unwrap(),
            ProvisioningParameters::default()
        );
        assert_eq!(open_details(&cipher, "").unwrap(), InstanceDetails::default());
    }

    #[test]
    fn test_reconcilable_derivation() {
        let record = |runtime: &str, kind: Option<&str>, state: Option<&str>| InstanceRecord {
            instance_id: "i".to_string(),
            runtime_id: runtime.to_string(),
            global_account_id: String::new(),
            subscription_global_account_id: String::new(),
            sub_account_id: String::new(),
            service_id: String::new(),
            service_plan_id: String::new(),
            service_plan_name: String::new(),
            provider: String::new(),
            provider_region: String::new(),
            provisioning_parameters: String::new(),
            instance_details: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            expired_at: None,
            version: 0,
            last_operation_type: kind.map(str::to_string),
            last_operation_state: state.map(str::to_string),
        };
        let cipher = FieldCipher::disabled();
        let reconcilable = |r: InstanceRecord| r.into_instance(&cipher).unwrap().reconcilable;

        assert!(reconcilable(record("rt", Some("provision"), Some("succeeded"))));
        assert!(reconcilable(record("rt", Some("update"), Some("failed"))));
        assert!(!reconcilable(record("", Some("provision"), Some("succeeded"))));
        assert!(!reconcilable(record("rt", Some("deprovision"), Some("succeeded"))));
        assert!(!reconcilable(record("rt", Some("update"), Some("in progress"))));
        assert!(!reconcilable(record("rt", None, None)));
    }
}
