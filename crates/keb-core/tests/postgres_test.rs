// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend tests.
//!
//! Run with `TEST_KEB_DATABASE_URL=postgres://... cargo test -p keb-core`.

mod common;

use chrono::{Duration, Utc};
use keb_core::model::{InstanceArchived, OperationState, RuntimeState};
use keb_core::persistence::{InstanceFilter, Persistence};

use common::*;

#[tokio::test]
async fn test_pg_instance_lifecycle() {
    skip_if_no_db!();
    let store = postgres_store().await.expect("postgres store");
    let id = unique_id("inst");

    store.insert_instance(&instance(&id, "rt-pg")).await.unwrap();
    assert!(store.insert_instance(&instance(&id, "rt-pg")).await.unwrap_err().is_already_exists());

    let loaded = store.get_instance(&id).await.unwrap();
    assert_eq!(loaded.instance_details.kubeconfig, "apiVersion: v1\nkind: Config");

    let stale = loaded.clone();
    let updated = store.update_instance(&loaded).await.unwrap();
    assert_eq!(updated.version, 1);
    assert!(store.update_instance(&stale).await.unwrap_err().is_conflict());

    store.delete_instance(&id).await.unwrap();
    assert!(store.get_instance(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_pg_operation_log_and_orphans() {
    skip_if_no_db!();
    let store = postgres_store().await.expect("postgres store");
    let id = unique_id("inst");
    let base = Utc::now() - Duration::hours(4);

    let provision = provisioning(&id, base);
    let deprovision = deprovisioning(&id, base + Duration::hours(1), OperationState::Pending);
    store.insert_operation(&provision).await.unwrap();
    store.insert_operation(&deprovision).await.unwrap();

    assert_eq!(store.get_last_operation(&id).await.unwrap().id, provision.id);

    let ops = store.list_operations_by_instance_id(&id).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].id, provision.id);

    // no instance row: the log counts as left behind
    let ids = store.list_deleted_instance_ids(100_000).await.unwrap();
    assert!(ids.contains(&id));

    store
        .insert_runtime_state(&RuntimeState::new(unique_id("rs"), "rt", &provision.id))
        .await
        .unwrap();
    store
        .delete_runtime_states_by_operation_id(&provision.id)
        .await
        .unwrap();
    for op in &ops {
        store.delete_operation(&op.id).await.unwrap();
    }
    assert!(!store.list_deleted_instance_ids(100_000).await.unwrap().contains(&id));
}

#[tokio::test]
async fn test_pg_filters_and_archive() {
    skip_if_no_db!();
    let store = postgres_store().await.expect("postgres store");
    let id = unique_id("inst");
    seed_provisioned(&store, &id, "rt-filter").await;

    let found = store
        .list_instances(&InstanceFilter {
            instance_ids: vec![id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].reconcilable);

    let ops = store.list_operations_by_instance_id(&id).await.unwrap();
    let archived = InstanceArchived::from_operations(&ops).unwrap();
    store.insert_instance_archived(&archived).await.unwrap();
    assert!(
        store
            .insert_instance_archived(&archived)
            .await
            .unwrap_err()
            .is_already_exists()
    );
    assert_eq!(store.get_instance_archived(&id).await.unwrap().instance_id, id);
}
