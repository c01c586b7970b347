// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archival of deprovisioned instances.
//!
//! An instance whose row is gone but whose operations remain is summarised
//! into an archive record, after which its operation log is purged. Runtime
//! states are always removed before the operation they belong to: if a run
//! stops in between, the instance id is still listed by the next run and the
//! purge resumes.

mod job;

use std::sync::Arc;

use keb_core::Persistence;
use keb_core::model::InstanceArchived;
use tracing::{debug, error, info, warn};

use crate::config::ArchiverConfig;
use crate::error::{Error, Result};

pub use job::run_job;

/// Behaviour switches of the archival run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSettings {
    /// Read and validate only.
    pub dry_run: bool,
    /// Remove the operation log after archiving.
    pub perform_deletion: bool,
    /// Instances handled by one batch.
    pub batch_size: i64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            dry_run: true,
            perform_deletion: false,
            batch_size: 50,
        }
    }
}

impl From<&ArchiverConfig> for ArchiveSettings {
    fn from(config: &ArchiverConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            perform_deletion: config.perform_deletion,
            batch_size: config.batch_size,
        }
    }
}

/// Counters of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Instances archived (or that would be, in dry-run mode).
    pub instances_processed: usize,
    pub operations_deleted: usize,
    /// Instances skipped because of a non-fatal error.
    pub instances_failed: usize,
}

pub struct ArchiveService {
    storage: Arc<dyn Persistence>,
    settings: ArchiveSettings,
}

impl ArchiveService {
    pub fn new(storage: Arc<dyn Persistence>, settings: ArchiveSettings) -> Self {
        Self { storage, settings }
    }

    pub fn settings(&self) -> ArchiveSettings {
        self.settings
    }

    /// Process one batch of deleted instances.
    ///
    /// Returns `Error::Fatal` and stops without touching further instances if
    /// a listed instance still exists.
    pub async fn run(&self) -> Result<BatchReport> {
        info!(
            dry_run = self.settings.dry_run,
            perform_deletion = self.settings.perform_deletion,
            batch_size = self.settings.batch_size,
            "Starting archiving batch"
        );
        let instance_ids = self
            .storage
            .list_deleted_instance_ids(self.settings.batch_size)
            .await
            .inspect_err(|e| error!(error = %e, "Unable to get instance ids"))?;
        info!(count = instance_ids.len(), "Got instance ids to process");

        let mut report = BatchReport::default();
        for instance_id in &instance_ids {
            match self.storage.get_instance(instance_id).await {
                Ok(instance) => {
                    error!(
                        instance_id = %instance_id,
                        created_at = %instance.created_at,
                        plan = %instance.service_plan_name,
                        "The instance still exists, aborting the process"
                    );
                    return Err(Error::Fatal(format!("instance {instance_id} exists")));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }

            if self.archive_instance(instance_id, &mut report).await {
                report.instances_processed += 1;
            } else {
                report.instances_failed += 1;
            }
        }
        Ok(report)
    }

    /// Archive one instance and purge its log. Returns false when the
    /// instance was skipped.
    async fn archive_instance(&self, instance_id: &str, report: &mut BatchReport) -> bool {
        let operations = match self.storage.list_operations_by_instance_id(instance_id).await {
            Ok(operations) => operations,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Unable to get operations for instance");
                return false;
            }
        };

        let archived = match InstanceArchived::from_operations(&operations) {
            Ok(archived) => archived,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Unable to create archived instance");
                return false;
            }
        };

        if self.settings.dry_run {
            debug!(instance_id = %instance_id, archived = ?archived, "Dry run: instance would be archived");
        } else {
            debug!(instance_id = %instance_id, "Archiving the instance");
            match self.storage.insert_instance_archived(&archived).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(instance_id = %instance_id, "Instance already archived");
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Unable to insert archived instance");
                    return false;
                }
            }
        }

        for operation in &operations {
            if self.settings.dry_run {
                debug!(operation_id = %operation.id, "Dry run: operation would be deleted");
                continue;
            }
            if !self.settings.perform_deletion {
                debug!(operation_id = %operation.id, "Deletion disabled, keeping operation");
                continue;
            }

            if let Err(e) = self
                .storage
                .delete_runtime_states_by_operation_id(&operation.id)
                .await
            {
                error!(operation_id = %operation.id, error = %e, "Unable to delete runtime states for operation");
                continue;
            }
            match self.storage.delete_operation(&operation.id).await {
                Ok(()) => report.operations_deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(operation_id = %operation.id, error = %e, "Unable to delete operation");
                }
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use keb_core::model::{
        ErsContext, Instance, Operation, OperationState, OperationType, ProvisioningParameters,
        RuntimeState,
    };
    use keb_core::persistence::{DeletedInstancesStatistics, InstanceFilter, SqlitePersistence};
    use keb_core::{ErrorKind, FieldCipher, plans};

    pub(crate) async fn store() -> Arc<dyn Persistence> {
        Arc::new(
            SqlitePersistence::in_memory(FieldCipher::disabled())
                .await
                .unwrap(),
        )
    }

    fn parameters() -> ProvisioningParameters {
        ProvisioningParameters {
            plan_id: plans::AWS_PLAN_ID.to_string(),
            platform_region: "cf-eu10".to_string(),
            ers_context: ErsContext {
                global_account_id: Some("ga-1".to_string()),
                subaccount_id: Some("sa-1".to_string()),
                user_id: Some("jane.doe@sap.com".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Provisioning and deprovisioning of a deleted instance, with a runtime
    /// state for each.
    pub(crate) async fn seed_deleted(store: &Arc<dyn Persistence>, instance_id: &str) {
        let started = Utc::now() - Duration::hours(5);
        let mut provisioning = Operation::provisioning(
            format!("{instance_id}-provisioning"),
            instance_id,
            parameters(),
        );
        provisioning.state = OperationState::Succeeded;
        provisioning.created_at = started;
        provisioning.updated_at = started + Duration::minutes(20);
        provisioning.instance_details.runtime_id = format!("{instance_id}-runtime");
        store.insert_operation(&provisioning).await.unwrap();

        let mut deprovisioning = Operation::deprovisioning(
            format!("{instance_id}-deprovisioning"),
            instance_id,
            parameters(),
        );
        deprovisioning.state = OperationState::Succeeded;
        deprovisioning.created_at = started + Duration::hours(2);
        deprovisioning.updated_at = started + Duration::hours(3);
        deprovisioning.instance_details.runtime_id = format!("{instance_id}-runtime");
        store.insert_operation(&deprovisioning).await.unwrap();

        for op in [&provisioning, &deprovisioning] {
            store
                .insert_runtime_state(&RuntimeState::new(
                    format!("{}-state", op.id),
                    format!("{instance_id}-runtime"),
                    &op.id,
                ))
                .await
                .unwrap();
        }
    }

    /// Soft-deleted instance whose deprovisioning failed and waits for a
    /// retrigger.
    pub(crate) async fn seed_failed_deprovisioning(store: &Arc<dyn Persistence>, instance_id: &str) {
        let mut instance = Instance::new(instance_id, plans::AWS_PLAN_ID);
        instance.deleted_at = Some(Utc::now());
        store.insert_instance(&instance).await.unwrap();

        let mut provisioning =
            Operation::provisioning(format!("{instance_id}-provisioning"), instance_id, parameters());
        provisioning.state = OperationState::Succeeded;
        provisioning.created_at = Utc::now() - Duration::hours(3);
        store.insert_operation(&provisioning).await.unwrap();

        let mut deprovisioning =
            Operation::deprovisioning(format!("{instance_id}-deprovisioning"), instance_id, parameters());
        deprovisioning.state = OperationState::Failed;
        store.insert_operation(&deprovisioning).await.unwrap();
    }

    /// Storage whose deleted-instance listing is stale: it also reports ids
    /// whose instance row exists again.
    pub(crate) struct StaleListing {
        pub(crate) inner: Arc<dyn Persistence>,
        pub(crate) extra_ids: Vec<String>,
    }

    type StorageResult<T> = std::result::Result<T, keb_core::StorageError>;

    #[async_trait::async_trait]
    impl Persistence for StaleListing {
        async fn get_instance(&self, instance_id: &str) -> StorageResult<Instance> {
            self.inner.get_instance(instance_id).await
        }
        async fn insert_instance(&self, instance: &Instance) -> StorageResult<()> {
            self.inner.insert_instance(instance).await
        }
        async fn update_instance(&self, instance: &Instance) -> StorageResult<Instance> {
            self.inner.update_instance(instance).await
        }
        async fn delete_instance(&self, instance_id: &str) -> StorageResult<()> {
            self.inner.delete_instance(instance_id).await
        }
        async fn list_instances(&self, filter: &InstanceFilter) -> StorageResult<Vec<Instance>> {
            self.inner.list_instances(filter).await
        }
        async fn list_deleted_instance_ids(&self, limit: i64) -> StorageResult<Vec<String>> {
            let mut ids = self.extra_ids.clone();
            ids.extend(self.inner.list_deleted_instance_ids(limit).await?);
            ids.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(ids)
        }
        async fn deleted_instances_statistics(&self) -> StorageResult<DeletedInstancesStatistics> {
            self.inner.deleted_instances_statistics().await
        }
        async fn insert_operation(&self, operation: &Operation) -> StorageResult<()> {
            self.inner.insert_operation(operation).await
        }
        async fn update_operation(&self, operation: &Operation) -> StorageResult<Operation> {
            self.inner.update_operation(operation).await
        }
        async fn get_operation(&self, operation_id: &str) -> StorageResult<Operation> {
            self.inner.get_operation(operation_id).await
        }
        async fn get_last_operation(&self, instance_id: &str) -> StorageResult<Operation> {
            self.inner.get_last_operation(instance_id).await
        }
        async fn list_operations_by_instance_id(
            &self,
            instance_id: &str,
        ) -> StorageResult<Vec<Operation>> {
            self.inner.list_operations_by_instance_id(instance_id).await
        }
        async fn list_not_finished_operations_by_type(
            &self,
            operation_type: OperationType,
        ) -> StorageResult<Vec<Operation>> {
            self.inner.list_not_finished_operations_by_type(operation_type).await
        }
        async fn delete_operation(&self, operation_id: &str) -> StorageResult<()> {
            self.inner.delete_operation(operation_id).await
        }
        async fn insert_runtime_state(&self, state: &RuntimeState) -> StorageResult<()> {
            self.inner.insert_runtime_state(state).await
        }
        async fn list_runtime_states_by_operation_id(
            &self,
            operation_id: &str,
        ) -> StorageResult<Vec<RuntimeState>> {
            self.inner.list_runtime_states_by_operation_id(operation_id).await
        }
        async fn delete_runtime_states_by_operation_id(&self, operation_id: &str) -> StorageResult<()> {
            self.inner.delete_runtime_states_by_operation_id(operation_id).await
        }
        async fn insert_instance_archived(&self, archived: &InstanceArchived) -> StorageResult<()> {
            self.inner.insert_instance_archived(archived).await
        }
        async fn get_instance_archived(&self, instance_id: &str) -> StorageResult<InstanceArchived> {
            self.inner.get_instance_archived(instance_id).await
        }
        async fn total_instances_archived(&self) -> StorageResult<i64> {
            self.inner.total_instances_archived().await
        }
    }

    fn deleting() -> ArchiveSettings {
        ArchiveSettings {
            dry_run: false,
            perform_deletion: true,
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn test_deleted_instances_are_archived_and_purged() {
        let store = store().await;
        for id in ["inst-deleted-01", "inst-deleted-02", "inst-deleted-03"] {
            seed_deleted(&store, id).await;
        }
        seed_failed_deprovisioning(&store, "inst-failed-deprovisioning-01").await;

        let report = ArchiveService::new(store.clone(), deleting()).run().await.unwrap();

        assert_eq!(report.instances_processed, 3);
        assert_eq!(report.operations_deleted, 6);
        assert_eq!(report.instances_failed, 0);
        for id in ["inst-deleted-01", "inst-deleted-02", "inst-deleted-03"] {
            assert!(store.list_operations_by_instance_id(id).await.unwrap().is_empty());
            let archived = store.get_instance_archived(id).await.unwrap();
            assert_eq!(archived.instance_id, id);
            assert_eq!(archived.last_runtime_id, format!("{id}-runtime"));
            assert!(archived.internal_user);
            assert!(
                store
                    .list_runtime_states_by_operation_id(&format!("{id}-provisioning"))
                    .await
                    .unwrap()
                    .is_empty()
            );
        }
        assert_eq!(
            store
                .list_operations_by_instance_id("inst-failed-deprovisioning-01")
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(
            store
                .get_instance_archived("inst-failed-deprovisioning-01")
                .await
                .unwrap_err()
                .is_not_found()
        );

        // Nothing is left for a second batch.
        let report = ArchiveService::new(store.clone(), deleting()).run().await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn test_already_archived_instance_is_purged() {
        let store = store().await;
        seed_deleted(&store, "inst-1").await;
        let operations = store.list_operations_by_instance_id("inst-1").await.unwrap();
        store
            .insert_instance_archived(&InstanceArchived::from_operations(&operations).unwrap())
            .await
            .unwrap();

        let report = ArchiveService::new(store.clone(), deleting()).run().await.unwrap();

        assert_eq!(report.instances_processed, 1);
        assert_eq!(report.operations_deleted, 2);
        assert_eq!(store.total_instances_archived().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_and_disabled_deletion() {
        let store = store().await;
        seed_deleted(&store, "inst-1").await;

        let dry = ArchiveSettings {
            dry_run: true,
            ..deleting()
        };
        let report = ArchiveService::new(store.clone(), dry).run().await.unwrap();
        assert_eq!(report.instances_processed, 1);
        assert_eq!(report.operations_deleted, 0);
        assert_eq!(store.total_instances_archived().await.unwrap(), 0);

        let keep = ArchiveSettings {
            perform_deletion: false,
            ..deleting()
        };
        let report = ArchiveService::new(store.clone(), keep).run().await.unwrap();
        assert_eq!(report.operations_deleted, 0);
        assert_eq!(store.total_instances_archived().await.unwrap(), 1);
        assert_eq!(store.list_operations_by_instance_id("inst-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_without_provisioning_is_skipped() {
        let store = store().await;
        let mut op = Operation::deprovisioning("orphan-deprovisioning", "orphan", parameters());
        op.state = OperationState::Succeeded;
        store.insert_operation(&op).await.unwrap();

        let report = ArchiveService::new(store.clone(), deleting()).run().await.unwrap();

        assert_eq!(report.instances_processed, 0);
        assert_eq!(report.instances_failed, 1);
        assert_eq!(store.list_operations_by_instance_id("orphan").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_limits_instances() {
        let store = store().await;
        for i in 0..3 {
            seed_deleted(&store, &format!("inst-{i}")).await;
        }
        let settings = ArchiveSettings {
            batch_size: 2,
            ..deleting()
        };

        let report = ArchiveService::new(store.clone(), settings).run().await.unwrap();

        assert_eq!(report.instances_processed, 2);
        assert_eq!(store.deleted_instances_statistics().await.unwrap().instances, 1);
    }

    #[tokio::test]
    async fn test_existing_instance_aborts_the_batch() {
        let store = store().await;
        seed_deleted(&store, "inst-deleted").await;
        store
            .insert_instance(&Instance::new("inst-live", plans::AWS_PLAN_ID))
            .await
            .unwrap();
        let stale: Arc<dyn Persistence> = Arc::new(StaleListing {
            inner: store.clone(),
            extra_ids: vec!["inst-live".to_string()],
        });

        let err = ArchiveService::new(stale, deleting()).run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(err, Error::Fatal(_)));
        // Nothing after the guard was touched.
        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
        assert_eq!(
            store.list_operations_by_instance_id("inst-deleted").await.unwrap().len(),
            2
        );
        assert!(store.get_instance("inst-live").await.is_ok());
    }
}
