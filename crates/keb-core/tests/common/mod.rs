// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for keb-core storage tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use keb_core::FieldCipher;
use keb_core::model::{
    ErsContext, Instance, InstanceDetails, Operation, OperationState, ProvisioningParameters,
    ServiceManagerOperatorCredentials,
};
use keb_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use keb_core::plans;
use uuid::Uuid;

/// Helper macro to skip tests if the PostgreSQL URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_KEB_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_KEB_DATABASE_URL not set");
            return;
        }
    };
}

pub const TEST_SECRET_KEY: &str = "test-secret-key-for-field-encryption";

pub async fn sqlite_store() -> SqlitePersistence {
    SqlitePersistence::in_memory(FieldCipher::new(TEST_SECRET_KEY))
        .await
        .expect("Failed to create in-memory store")
}

/// Connect to the PostgreSQL test database and run migrations.
pub async fn postgres_store() -> Option<PostgresPersistence> {
    let url = std::env::var("TEST_KEB_DATABASE_URL").ok()?;
    PostgresPersistence::connect(&url, 5, FieldCipher::new(TEST_SECRET_KEY))
        .await
        .ok()
}

pub fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn provisioning_parameters(plan_id: &str) -> ProvisioningParameters {
    ProvisioningParameters {
        plan_id: plan_id.to_string(),
        service_id: plans::KYMA_SERVICE_ID.to_string(),
        ers_context: ErsContext {
            global_account_id: Some("ga-1".to_string()),
            subaccount_id: Some("sa-1".to_string()),
            user_id: Some("john.smith@example.com".to_string()),
            sm_operator_credentials: Some(ServiceManagerOperatorCredentials {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                sm_url: "https://sm.example.com".to_string(),
                url: "https://token.example.com".to_string(),
                xsappname: "app".to_string(),
            }),
            ..Default::default()
        },
        platform_region: "cf-eu10".to_string(),
        platform_provider: "AWS".to_string(),
        ..Default::default()
    }
}

pub fn instance(instance_id: &str, runtime_id: &str) -> Instance {
    let mut instance = Instance::new(instance_id, plans::AWS_PLAN_ID);
    instance.runtime_id = runtime_id.to_string();
    instance.global_account_id = "ga-1".to_string();
    instance.subaccount_id = "sa-1".to_string();
    instance.provider = "AWS".to_string();
    instance.provider_region = "eu-central-1".to_string();
    instance.parameters = provisioning_parameters(plans::AWS_PLAN_ID);
    instance.instance_details = InstanceDetails {
        runtime_id: runtime_id.to_string(),
        subaccount_id: "sa-1".to_string(),
        shoot_name: "c-1234567".to_string(),
        region: "eu-central-1".to_string(),
        sm_cluster_id: "sm-cluster".to_string(),
        kyma_resource_namespace: "kcp-system".to_string(),
        kubeconfig: "apiVersion: v1\nkind: Config".to_string(),
        ..Default::default()
    };
    instance
}

pub fn provisioning(instance_id: &str, created_at: DateTime<Utc>) -> Operation {
    let mut op = Operation::provisioning(
        unique_id("op"),
        instance_id,
        provisioning_parameters(plans::AWS_PLAN_ID),
    );
    op.state = OperationState::Succeeded;
    op.created_at = created_at;
    op.updated_at = created_at + Duration::minutes(10);
    op
}

pub fn deprovisioning(
    instance_id: &str,
    created_at: DateTime<Utc>,
    state: OperationState,
) -> Operation {
    let mut op = Operation::deprovisioning(
        unique_id("op"),
        instance_id,
        provisioning_parameters(plans::AWS_PLAN_ID),
    );
    op.state = state;
    op.created_at = created_at;
    op.updated_at = created_at + Duration::minutes(5);
    op
}

/// Insert an instance with a succeeded provisioning.
pub async fn seed_provisioned(store: &dyn Persistence, instance_id: &str, runtime_id: &str) {
    store
        .insert_instance(&instance(instance_id, runtime_id))
        .await
        .expect("Failed to insert instance");
    store
        .insert_operation(&provisioning(instance_id, Utc::now() - Duration::hours(2)))
        .await
        .expect("Failed to insert operation");
}
