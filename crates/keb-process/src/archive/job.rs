// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repeated archival batches until the backlog is drained.

use keb_core::Persistence;
use tracing::{error, info};

use super::{ArchiveService, BatchReport};
use crate::error::Result;

async fn log_totals(storage: &dyn Persistence) -> Result<()> {
    let archived = storage.total_instances_archived().await?;
    let stats = storage.deleted_instances_statistics().await?;
    info!(
        instances_archived = archived,
        deleted_instances = stats.instances,
        deleted_instances_operations = stats.operations,
        "Archiving statistics"
    );
    Ok(())
}

/// Run batches until one processes nothing.
///
/// A dry run, or a run that keeps the operation log, stops after the first
/// batch since the same instances would be listed again. Returns the summed
/// counters.
pub async fn run_job(service: &ArchiveService, storage: &dyn Persistence) -> Result<BatchReport> {
    log_totals(storage).await?;

    let settings = service.settings();
    let mut total = BatchReport::default();
    loop {
        let report = service.run().await.inspect_err(|e| {
            error!(error = %e, "Archiving batch failed");
        })?;
        info!(
            instances_processed = report.instances_processed,
            operations_deleted = report.operations_deleted,
            instances_failed = report.instances_failed,
            "Archiving batch finished"
        );
        total.instances_processed += report.instances_processed;
        total.operations_deleted += report.operations_deleted;
        total.instances_failed += report.instances_failed;

        if settings.dry_run || !settings.perform_deletion || report.instances_processed == 0 {
            break;
        }
    }

    log_totals(storage).await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveSettings;
    use crate::archive::tests::{StaleListing, seed_deleted, seed_failed_deprovisioning, store};
    use crate::error::Error;
    use keb_core::model::Instance;
    use keb_core::plans;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_job_drains_backlog_in_batches() {
        let store = store().await;
        for i in 0..5 {
            seed_deleted(&store, &format!("inst-{i}")).await;
        }
        seed_failed_deprovisioning(&store, "inst-failed").await;
        let service = ArchiveService::new(
            store.clone(),
            ArchiveSettings {
                dry_run: false,
                perform_deletion: true,
                batch_size: 2,
            },
        );

        let total = run_job(&service, store.as_ref()).await.unwrap();

        assert_eq!(total.instances_processed, 5);
        assert_eq!(total.operations_deleted, 10);
        assert_eq!(store.total_instances_archived().await.unwrap(), 5);
        let stats = store.deleted_instances_statistics().await.unwrap();
        assert_eq!(stats.instances, 0);
        assert_eq!(stats.operations, 0);
        assert_eq!(
            store.list_operations_by_instance_id("inst-failed").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_dry_run_stops_after_one_batch() {
        let store = store().await;
        for i in 0..3 {
            seed_deleted(&store, &format!("inst-{i}")).await;
        }
        let service = ArchiveService::new(
            store.clone(),
            ArchiveSettings {
                dry_run: true,
                perform_deletion: true,
                batch_size: 2,
            },
        );

        let total = run_job(&service, store.as_ref()).await.unwrap();

        assert_eq!(total.instances_processed, 2);
        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
        assert_eq!(store.deleted_instances_statistics().await.unwrap().instances, 3);
    }

    #[tokio::test]
    async fn test_fatal_batch_stops_the_job() {
        let store = store().await;
        seed_deleted(&store, "inst-1").await;
        store
            .insert_instance(&Instance::new("inst-live", plans::AWS_PLAN_ID))
            .await
            .unwrap();
        let stale: Arc<dyn Persistence> = Arc::new(StaleListing {
            inner: store.clone(),
            extra_ids: vec!["inst-live".to_string()],
        });
        let service = ArchiveService::new(
            stale.clone(),
            ArchiveSettings {
                dry_run: false,
                perform_deletion: true,
                batch_size: 10,
            },
        );

        let err = run_job(&service, stale.as_ref()).await.unwrap_err();

        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
    }
}
