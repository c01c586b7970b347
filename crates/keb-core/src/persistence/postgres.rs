// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for instances, operations, runtime states and archives.

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::crypto::FieldCipher;
use crate::error::{Result, StorageError};
use crate::model::{Instance, InstanceArchived, Operation, OperationType, RuntimeState};

use super::{
    DeletedInstancesStatistics, InstanceFilter, InstanceRecord, OperationRecord, Persistence,
    RuntimeStateRecord, SealedInstance, SealedOperation,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
    cipher: FieldCipher,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence from an existing pool.
    pub fn new(pool: PgPool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    /// Connect, run migrations and return a ready persistence.
    pub async fn connect(url: &str, max_connections: u32, cipher: FieldCipher) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Self::new(pool, cipher))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

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

// ============================================================================
// Instance Operations
// ============================================================================

/// Get an instance by id.
pub async fn get_instance(
    pool: &PgPool,
    cipher: &FieldCipher,
    instance_id: &str,
) -> Result<Instance> {
    let sql = format!("{INSTANCE_SELECT} WHERE i.instance_id = $1");
    let record = sqlx::query_as::<_, InstanceRecord>(&sql)
        .bind(instance_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found("instance", instance_id))?;

    record.into_instance(cipher)
}

/// Insert an instance.
pub async fn insert_instance(
    pool: &PgPool,
    cipher: &FieldCipher,
    instance: &Instance,
) -> Result<()> {
    let sealed = SealedInstance::seal(instance, cipher)?;
    sqlx::query(
        r#"
        INSERT INTO instances (
            instance_id, runtime_id, global_account_id, subscription_global_account_id,
            sub_account_id, service_id, service_plan_id, service_plan_name, provider,
            provider_region, provisioning_parameters, instance_details, created_at,
            updated_at, deleted_at, expired_at, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
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
    .execute(pool)
    .await
    .map_err(|e| StorageError::from_insert(e, "instance", &instance.instance_id))?;

    Ok(())
}

/// Version-checked instance update.
pub async fn update_instance(
    pool: &PgPool,
    cipher: &FieldCipher,
    instance: &Instance,
) -> Result<Instance> {
    let sealed = SealedInstance::seal(instance, cipher)?;
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET runtime_id = $3, global_account_id = $4, subscription_global_account_id = $5,
            sub_account_id = $6, service_plan_id = $7, service_plan_name = $8,
            provider = $9, provider_region = $10, provisioning_parameters = $11,
            instance_details = $12, updated_at = $13, deleted_at = $14, expired_at = $15,
            version = version + 1
        WHERE instance_id = $1 AND version = $2
        "#,
    )
    .bind(&instance.instance_id)
    .bind(instance.version)
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
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_conflict(
            pool,
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

/// Hard-delete an instance.
pub async fn delete_instance(pool: &PgPool, instance_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::not_found("instance", instance_id));
    }
    Ok(())
}

/// List instances matching a filter.
pub async fn list_instances(
    pool: &PgPool,
    cipher: &FieldCipher,
    filter: &InstanceFilter,
) -> Result<Vec<Instance>> {
    let mut qb = QueryBuilder::<Postgres>::new(INSTANCE_SELECT);
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

    let records = qb.build_query_as::<InstanceRecord>().fetch_all(pool).await?;
    records
        .into_iter()
        .map(|r| r.into_instance(cipher))
        .collect()
}

fn push_in<'a>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, values: &'a [String]) {
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

/// Ids of removed instances that still own operations.
pub async fn list_deleted_instance_ids(pool: &PgPool, limit: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT o.instance_id
        FROM operations o
        WHERE NOT EXISTS (SELECT 1 FROM instances i WHERE i.instance_id = o.instance_id)
        ORDER BY o.instance_id
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Counts of removed-but-not-archived instances and their operations.
pub async fn deleted_instances_statistics(pool: &PgPool) -> Result<DeletedInstancesStatistics> {
    let (instances, operations) = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT COUNT(DISTINCT o.instance_id), COUNT(*)
        FROM operations o
        WHERE NOT EXISTS (SELECT 1 FROM instances i WHERE i.instance_id = o.instance_id)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DeletedInstancesStatistics {
        instances,
        operations,
    })
}

// ============================================================================
// Operation Operations
// ============================================================================

/// Insert an operation.
pub async fn insert_operation(
    pool: &PgPool,
    cipher: &FieldCipher,
    operation: &Operation,
) -> Result<()> {
    let sealed = SealedOperation::seal(operation, cipher)?;
    sqlx::query(
        r#"
        INSERT INTO operations (
            id, instance_id, version, created_at, updated_at, type, state, description,
            provisioning_parameters, instance_details, data, finished_stages
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
    .execute(pool)
    .await
    .map_err(|e| StorageError::from_insert(e, "operation", &operation.id))?;

    Ok(())
}

/// Version-checked operation update; refreshes `updated_at`.
pub async fn update_operation(
    pool: &PgPool,
    cipher: &FieldCipher,
    operation: &Operation,
) -> Result<Operation> {
    let sealed = SealedOperation::seal(operation, cipher)?;
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET state = $3, description = $4, provisioning_parameters = $5,
            instance_details = $6, data = $7, finished_stages = $8,
            updated_at = $9, version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(&operation.id)
    .bind(operation.version)
    .bind(operation.state.as_str())
    .bind(&operation.description)
    .bind(&sealed.parameters)
    .bind(&sealed.details)
    .bind(&sealed.data)
    .bind(&sealed.finished_stages)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_conflict(
            pool,
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

/// Get an operation by id.
pub async fn get_operation(
    pool: &PgPool,
    cipher: &FieldCipher,
    operation_id: &str,
) -> Result<Operation> {
    let sql = format!("{OPERATION_SELECT} WHERE id = $1");
    sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(operation_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found("operation", operation_id))?
        .into_operation(cipher)
}

/// Most recent non-pending operation of an instance.
pub async fn get_last_operation(
    pool: &PgPool,
    cipher: &FieldCipher,
    instance_id: &str,
) -> Result<Operation> {
    let sql = format!(
        "{OPERATION_SELECT} WHERE instance_id = $1 AND state <> 'pending' ORDER BY created_at DESC LIMIT 1"
    );
    sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(instance_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found("operation", format!("last of {instance_id}")))?
        .into_operation(cipher)
}

/// Operations of an instance, oldest first.
pub async fn list_operations_by_instance_id(
    pool: &PgPool,
    cipher: &FieldCipher,
    instance_id: &str,
) -> Result<Vec<Operation>> {
    let sql = format!("{OPERATION_SELECT} WHERE instance_id = $1 ORDER BY created_at ASC");
    let records = sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(instance_id)
        .fetch_all(pool)
        .await?;

    records.into_iter().map(|r| r.into_operation(cipher)).collect()
}

/// Pending and in-progress operations of a type, oldest first.
pub async fn list_not_finished_operations_by_type(
    pool: &PgPool,
    cipher: &FieldCipher,
    operation_type: OperationType,
) -> Result<Vec<Operation>> {
    let sql = format!(
        "{OPERATION_SELECT} WHERE type = $1 AND state IN ('pending', 'in progress') ORDER BY created_at ASC"
    );
    let records = sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(operation_type.as_str())
        .fetch_all(pool)
        .await?;

    records.into_iter().map(|r| r.into_operation(cipher)).collect()
}

/// Delete an operation.
pub async fn delete_operation(pool: &PgPool, operation_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM operations WHERE id = $1")
        .bind(operation_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::not_found("operation", operation_id));
    }
    Ok(())
}

// ============================================================================
// Runtime State Operations
// ============================================================================

/// Insert a runtime state.
pub async fn insert_runtime_state(
    pool: &PgPool,
    cipher: &FieldCipher,
    state: &RuntimeState,
) -> Result<()> {
    let kyma_config = cipher.encrypt(&state.kyma_config)?;
    sqlx::query(
        r#"
        INSERT INTO runtime_states (id, created_at, runtime_id, operation_id, kyma_config, cluster_config, k8s_version)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&state.id)
    .bind(state.created_at)
    .bind(&state.runtime_id)
    .bind(&state.operation_id)
    .bind(&kyma_config)
    .bind(&state.cluster_config)
    .bind(&state.k8s_version)
    .execute(pool)
    .await
    .map_err(|e| StorageError::from_insert(e, "runtime_state", &state.id))?;

    Ok(())
}

/// Runtime states of an operation.
pub async fn list_runtime_states_by_operation_id(
    pool: &PgPool,
    cipher: &FieldCipher,
    operation_id: &str,
) -> Result<Vec<RuntimeState>> {
    let records = sqlx::query_as::<_, RuntimeStateRecord>(
        r#"
        SELECT id, created_at, runtime_id, operation_id, kyma_config, cluster_config, k8s_version
        FROM runtime_states
        WHERE operation_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await?;

    records
        .into_iter()
        .map(|r| r.into_runtime_state(cipher))
        .collect()
}

/// Delete the runtime states of an operation.
pub async fn delete_runtime_states_by_operation_id(pool: &PgPool, operation_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM runtime_states WHERE operation_id = $1")
        .bind(operation_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Archive Operations
// ============================================================================

/// Insert an archive row.
pub async fn insert_instance_archived(pool: &PgPool, archived: &InstanceArchived) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instances_archived (
            instance_id, global_account_id, subaccount_id, subscription_global_account_id,
            plan_id, plan_name, subaccount_region, region, provider, last_runtime_id,
            internal_user, shoot_name, provisioning_started_at, provisioning_finished_at,
            provisioning_state, first_deprovisioning_started_at,
            first_deprovisioning_finished_at, last_deprovisioning_finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
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
    .execute(pool)
    .await
    .map_err(|e| StorageError::from_insert(e, "instance_archived", &archived.instance_id))?;

    Ok(())
}

/// Get an archive row.
pub async fn get_instance_archived(pool: &PgPool, instance_id: &str) -> Result<InstanceArchived> {
    sqlx::query_as::<_, InstanceArchived>("SELECT * FROM instances_archived WHERE instance_id = $1")
        .bind(instance_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found("instance_archived", instance_id))
}

/// Number of archive rows.
pub async fn total_instances_archived(pool: &PgPool) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM instances_archived")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Tell a version mismatch from a missing row after an update touched nothing.
async fn missing_or_conflict(
    pool: &PgPool,
    table: &str,
    key_column: &str,
    entity: &'static str,
    id: &str,
    expected: i32,
) -> StorageError {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE {key_column} = $1");
    match sqlx::query_scalar::<_, i64>(&sql).bind(id).fetch_one(pool).await {
        Ok(0) => StorageError::not_found(entity, id),
        Ok(_) => StorageError::conflict(entity, id, expected),
        Err(e) => StorageError::Database(e),
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        get_instance(&self.pool, &self.cipher, instance_id).await
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        insert_instance(&self.pool, &self.cipher, instance).await
    }

    async fn update_instance(&self, instance: &Instance) -> Result<Instance> {
        update_instance(&self.pool, &self.cipher, instance).await
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        delete_instance(&self.pool, instance_id).await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        list_instances(&self.pool, &self.cipher, filter).await
    }

    async fn list_deleted_instance_ids(&self, limit: i64) -> Result<Vec<String>> {
        list_deleted_instance_ids(&self.pool, limit).await
    }

    async fn deleted_instances_statistics(&self) -> Result<DeletedInstancesStatistics> {
        deleted_instances_statistics(&self.pool).await
    }

    async fn insert_operation(&self, operation: &Operation) -> Result<()> {
        insert_operation(&self.pool, &self.cipher, operation).await
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation> {
        update_operation(&self.pool, &self.cipher, operation).await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        get_operation(&self.pool, &self.cipher, operation_id).await
    }

    async fn get_last_operation(&self, instance_id: &str) -> Result<Operation> {
        get_last_operation(&self.pool, &self.cipher, instance_id).await
    }

    async fn list_operations_by_instance_id(&self, instance_id: &str) -> Result<Vec<Operation>> {
        list_operations_by_instance_id(&self.pool, &self.cipher, instance_id).await
    }

    async fn list_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>> {
        list_not_finished_operations_by_type(&self.pool, &self.cipher, operation_type).await
    }

    async fn delete_operation(&self, operation_id: &str) -> Result<()> {
        delete_operation(&self.pool, operation_id).await
    }

    async fn insert_runtime_state(&self, state: &RuntimeState) -> Result<()> {
        insert_runtime_state(&self.pool, &self.cipher, state).await
    }

    async fn list_runtime_states_by_operation_id(
        &self,
        operation_id: &str,
    ) -> Result<Vec<RuntimeState>> {
        list_runtime_states_by_operation_id(&self.pool, &self.cipher, operation_id).await
    }

    async fn delete_runtime_states_by_operation_id(&self, operation_id: &str) -> Result<()> {
        delete_runtime_states_by_operation_id(&self.pool, operation_id).await
    }

    async fn insert_instance_archived(&self, archived: &InstanceArchived) -> Result<()> {
        insert_instance_archived(&self.pool, archived).await
    }

    async fn get_instance_archived(&self, instance_id: &str) -> Result<InstanceArchived> {
        get_instance_archived(&self.pool, instance_id).await
    }

    async fn total_instances_archived(&self) -> Result<i64> {
        total_instances_archived(&self.pool).await
    }
}
