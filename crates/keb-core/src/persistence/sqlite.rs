//! SQLite-backed persistence implementation.
//!
//! Used for embedded deployments and as the storage of the test suites.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::crypto::FieldCipher;
use crate::error::{Result, StorageError};
use crate::model::{Instance, InstanceArchived, Operation, OperationType, RuntimeState};

use super::{
    DeletedInstancesStatistics, InstanceFilter, InstanceRecord, OperationRecord, Persistence,
    RuntimeStateRecord, SealedInstance, SealedOperation,
};

const INSTANCE_SELECT: &str = r#"
    SELECT i.instance_id, i.runtime_id, i.global_account_id, i.subscription_global_account_id,
           i.sub_account_id, i.service_id, i.service_plan_id, i.service_plan_name,
           i.provider, i.provider_region, i.provisioning_parameters, i.instance_details,
           i.created_at, i.updated_at, i.deleted_at, i.expired_at, i.version,
           (SELECT o.type FROM operations o WHERE o.instance_id = i.instance_id
             ORDER BY o.created_at DESC LIMIT 1) AS last_operation_type,
           (SELECT o.state FROM operations o WHERE o.instance_id = i.instance_id
             ORDER BY o.created_at DESC LIMIT 1) AS last_operation_state
    FROM instances i
"#;

const OPERATION_SELECT: &str = r#"
    SELECT id, instance_id, version, created_at, updated_at, type, state, description,
           provisioning_parameters, instance_details, data, finished_stages
    FROM operations
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    cipher: FieldCipher,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>, cipher: FieldCipher) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database(e.into()))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool, cipher })
    }

    /// A private in-memory database, migrated and ready.
    ///
    /// The pool holds a single connection that is never recycled; closing it
    /// would discard the database.
    pub async fn in_memory(cipher: FieldCipher) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool, cipher })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn missing_or_conflict(
        &self,
        table: &str,
        key_column: &str,
        entity: &'static str,
        id: &str,
        expected: i32,
    ) -> StorageError {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE {key_column} = ?");
        match sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
        {
            Ok(0) => StorageError::not_found(entity, id),
            Ok(_) => StorageError::conflict(entity, id, expected),
            Err(e) => StorageError::Database(e),
        }
    }
}

fn push_in<'a>(qb: &mut QueryBuilder<'a, Sqlite>, column: &str, values: &'a [String]) {
    if values.is_empty() {
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        let sql = format!("{INSTANCE_SELECT} WHERE i.instance_id = ?");
        sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("instance", instance_id))?
            .into_instance(&self.cipher)
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let sealed = SealedInstance::seal(instance, &self.cipher)?;
        sqlx::query(
            r#"
            INSERT INTO instances (
                instance_id, runtime_id, global_account_id, subscription_global_account_id,
                sub_account_id, service_id, service_plan_id, service_plan_name, provider,
                provider_region, provisioning_parameters, instance_details, created_at,
                updated_at, deleted_at, expired_at, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.runtime_id)
        .bind(&instance.global_account_id)
        .bind(&instance.subscription_global_account_id)
        .bind(&instance.subaccount_id)
        .bind(&instance.service_id)
        .bind(&instance.service_plan_id)
        .bind(&instance.service_plan_name)
        .bind(&instance.provider)
        .bind(&instance.provider_region)
        .bind(&sealed.parameters)
        .bind(&sealed.details)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.deleted_at)
        .bind(instance.expired_at)
        .bind(instance.version)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_insert(e, "instance", &instance.instance_id))?;

        Ok(())
    }

    async fn update_instance(&self, instance: &Instance) -> Result<Instance> {
        let sealed = SealedInstance::seal(instance, &self.cipher)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET runtime_id = ?, global_account_id = ?, subscription_global_account_id = ?,
                sub_account_id = ?, service_plan_id = ?, service_plan_name = ?,
                provider = ?, provider_region = ?, provisioning_parameters = ?,
                instance_details = ?, updated_at = ?, deleted_at = ?, expired_at = ?,
                version = version + 1
            WHERE instance_id = ? AND version = ?
            "#,
        )
        .bind(&instance.runtime_id)
        .bind(&instance.global_account_id)
        .bind(&instance.subscription_global_account_id)
        .bind(&instance.subaccount_id)
        .bind(&instance.service_plan_id)
        .bind(&instance.service_plan_name)
        .bind(&instance.provider)
        .bind(&instance.provider_region)
        .bind(&sealed.parameters)
        .bind(&sealed.details)
        .bind(now)
        .bind(instance.deleted_at)
        .bind(instance.expired_at)
        .bind(&instance.instance_id)
        .bind(instance.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missing_or_conflict(
                    "instances",
                    "instance_id",
                    "instance",
                    &instance.instance_id,
                    instance.version,
                )
                .await);
        }

        let mut updated = instance.clone();
        updated.version += 1;
        updated.updated_at = now;
        Ok(updated)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("instance", instance_id));
        }
        Ok(())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        let mut qb = QueryBuilder::<Sqlite>::new(INSTANCE_SELECT);
        qb.push(" WHERE 1 = 1");
        push_in(&mut qb, "i.instance_id", &filter.instance_ids);
        push_in(&mut qb, "i.service_plan_id", &filter.plan_ids);
        push_in(&mut qb, "i.sub_account_id", &filter.subaccount_ids);
        push_in(&mut qb, "i.global_account_id", &filter.global_account_ids);
        push_in(&mut qb, "i.runtime_id", &filter.runtime_ids);
        match filter.deletion_attempted {
            Some(true) => {
                qb.push(" AND i.deleted_at IS NOT NULL");
            }
            Some(false) => {
                qb.push(" AND i.deleted_at IS NULL");
            }
            None => {}
        }
        qb.push(" ORDER BY i.created_at");

        let records = qb
            .build_query_as::<InstanceRecord>()
            .fetch_all(&self.pool)
            .await?;
        records
            .into_iter()
            .map(|r| r.into_instance(&self.cipher))
            .collect()
    }

    async fn list_deleted_instance_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT o.instance_id
            FROM operations o
            WHERE NOT EXISTS (SELECT 1 FROM instances i WHERE i.instance_id = o.instance_id)
            ORDER BY o.instance_id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn deleted_instances_statistics(&self) -> Result<DeletedInstancesStatistics> {
        let (instances, operations) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(DISTINCT o.instance_id), COUNT(*)
            FROM operations o
            WHERE NOT EXISTS (SELECT 1 FROM instances i WHERE i.instance_id = o.instance_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DeletedInstancesStatistics {
            instances,
            operations,
        })
    }

    async fn insert_operation(&self, operation: &Operation) -> Result<()> {
        let sealed = SealedOperation::seal(operation, &self.cipher)?;
        sqlx::query(
            r#"
            INSERT INTO operations (
                id, instance_id, version, created_at, updated_at, type, state, description,
                provisioning_parameters, instance_details, data, finished_stages
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&operation.id)
        .bind(&operation.instance_id)
        .bind(operation.version)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .bind(operation.operation_type.as_str())
        .bind(operation.state.as_str())
        .bind(&operation.description)
        .bind(&sealed.parameters)
        .bind(&sealed.details)
        .bind(&sealed.data)
        .bind(&sealed.finished_stages)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_insert(e, "operation", &operation.id))?;

        Ok(())
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation> {
        let sealed = SealedOperation::seal(operation, &self.cipher)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET state = ?, description = ?, provisioning_parameters = ?, instance_details = ?,
                data = ?, finished_stages = ?, updated_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(operation.state.as_str())
        .bind(&operation.description)
        .bind(&sealed.parameters)
        .bind(&sealed.details)
        .bind(&sealed.data)
        .bind(&sealed.finished_stages)
        .bind(now)
        .bind(&operation.id)
        .bind(operation.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missing_or_conflict(
                    "operations",
                    "id",
                    "operation",
                    &operation.id,
                    operation.version,
                )
                .await);
        }

        let mut updated = operation.clone();
        updated.version += 1;
        updated.updated_at = now;
        Ok(updated)
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        let sql = format!("{OPERATION_SELECT} WHERE id = ?");
        sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("operation", operation_id))?
            .into_operation(&self.cipher)
    }

    async fn get_last_operation(&self, instance_id: &str) -> Result<Operation> {
        let sql = format!(
            "{OPERATION_SELECT} WHERE instance_id = ? AND state <> 'pending' \
             ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("operation", format!("last of {instance_id}")))?
            .into_operation(&self.cipher)
    }

    async fn list_operations_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>> {
        let sql = format!("{OPERATION_SELECT} WHERE instance_id = ? ORDER BY created_at ASC");
        let records = sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;

        records
            .into_iter()
            .map(|r| r.into_operation(&self.cipher))
            .collect()
    }

    async fn list_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>> {
        let sql = format!(
            "{OPERATION_SELECT} WHERE type = ? AND state IN ('pending', 'in progress') \
             ORDER BY created_at ASC"
        );
        let records = sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(operation_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        records
            .into_iter()
            .map(|r| r.into_operation(&self.cipher))
            .collect()
    }

    async fn delete_operation(&self, operation_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("operation", operation_id));
        }
        Ok(())
    }

    async fn insert_runtime_state(&self, state: &RuntimeState) -> Result<()> {
        let kyma_config = self.cipher.encrypt(&state.kyma_config)?;
        sqlx::query(
            r#"
            INSERT INTO runtime_states (
                id, created_at, runtime_id, operation_id, kyma_config, cluster_config, k8s_version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(state.created_at)
        .bind(&state.runtime_id)
        .bind(&state.operation_id)
        .bind(&kyma_config)
        .bind(&state.cluster_config)
        .bind(&state.k8s_version)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_insert(e, "runtime_state", &state.id))?;

        Ok(())
    }

    async fn list_runtime_states_by_operation_id(
        &self,
        operation_id: &str,
    ) -> Result<Vec<RuntimeState>> {
        let records = sqlx::query_as::<_, RuntimeStateRecord>(
            r#"
            SELECT id, created_at, runtime_id, operation_id, kyma_config, cluster_config, k8s_version
            FROM runtime_states
            WHERE operation_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await?;

        records
            .into_iter()
            .map(|r| r.into_runtime_state(&self.cipher))
            .collect()
    }

    async fn delete_runtime_states_by_operation_id(&self, operation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM runtime_states WHERE operation_id = ?")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_instance_archived(&self, archived: &InstanceArchived) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances_archived (
                instance_id, global_account_id, subaccount_id, subscription_global_account_id,
                plan_id, plan_name, subaccount_region, region, provider, last_runtime_id,
                internal_user, shoot_name, provisioning_started_at, provisioning_finished_at,
                provisioning_state, first_deprovisioning_started_at,
                first_deprovisioning_finished_at, last_deprovisioning_finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&archived.instance_id)
        .bind(&archived.global_account_id)
        .bind(&archived.subaccount_id)
        .bind(&archived.subscription_global_account_id)
        .bind(&archived.plan_id)
        .bind(&archived.plan_name)
        .bind(&archived.subaccount_region)
        .bind(&archived.region)
        .bind(&archived.provider)
        .bind(&archived.last_runtime_id)
        .bind(archived.internal_user)
        .bind(&archived.shoot_name)
        .bind(archived.provisioning_started_at)
        .bind(archived.provisioning_finished_at)
        .bind(&archived.provisioning_state)
        .bind(archived.first_deprovisioning_started_at)
        .bind(archived.first_deprovisioning_finished_at)
        .bind(archived.last_deprovisioning_finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_insert(e, "instance_archived", &archived.instance_id))?;

        Ok(())
    }

    async fn get_instance_archived(&self, instance_id: &str) -> Result<InstanceArchived> {
        sqlx::query_as::<_, InstanceArchived>(
            "SELECT * FROM instances_archived WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("instance_archived", instance_id))
    }

    async fn total_instances_archived(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM instances_archived")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
