// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for step tests.

use std::sync::Arc;

use chrono::{Duration, Utc};
use keb_core::FieldCipher;
use keb_core::model::{
    ErsContext, Instance, InstanceDetails, Operation, OperationState, ProvisioningParameters,
};
use keb_core::persistence::{Persistence, SqlitePersistence};
use keb_core::plans;

pub const INSTANCE_ID: &str = "inst-1";
pub const RUNTIME_ID: &str = "Runtime-1";
pub const OPERATION_ID: &str = "deprovisioning-op";
pub const GLOBAL_ACCOUNT_ID: &str = "ga-1";
pub const SUBACCOUNT_ID: &str = "SA-1";

pub async fn store() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory(FieldCipher::disabled())
            .await
            .unwrap(),
    )
}

pub fn parameters(plan_id: &str) -> ProvisioningParameters {
    ProvisioningParameters {
        plan_id: plan_id.to_string(),
        service_id: plans::KYMA_SERVICE_ID.to_string(),
        ers_context: ErsContext {
            global_account_id: Some(GLOBAL_ACCOUNT_ID.to_string()),
            subaccount_id: Some(SUBACCOUNT_ID.to_string()),
            user_id: Some("john.smith@sap.com".to_string()),
            ..Default::default()
        },
        platform_region: "cf-eu10".to_string(),
        platform_provider: "AWS".to_string(),
        ..Default::default()
    }
}

pub fn details() -> InstanceDetails {
    InstanceDetails {
        runtime_id: RUNTIME_ID.to_string(),
        subaccount_id: SUBACCOUNT_ID.to_string(),
        shoot_name: "c-1234567".to_string(),
        region: "eu-central-1".to_string(),
        kyma_resource_namespace: "kcp-system".to_string(),
        ..Default::default()
    }
}

pub fn instance(plan_id: &str) -> Instance {
    let mut instance = Instance::new(INSTANCE_ID, plan_id);
    instance.runtime_id = RUNTIME_ID.to_string();
    instance.global_account_id = GLOBAL_ACCOUNT_ID.to_string();
    instance.subaccount_id = SUBACCOUNT_ID.to_string();
    instance.provider = "AWS".to_string();
    instance.provider_region = "eu-central-1".to_string();
    instance.parameters = parameters(plan_id);
    instance.instance_details = details();
    instance
}

/// Deprovisioning operation in progress, with instance details already copied.
pub fn operation(plan_id: &str) -> Operation {
    let mut op = Operation::deprovisioning(OPERATION_ID, INSTANCE_ID, parameters(plan_id));
    op.state = OperationState::InProgress;
    op.instance_details = details();
    op
}

/// Insert `instance` with a succeeded provisioning operation.
pub async fn seed_instance(store: &Arc<dyn Persistence>, instance: &Instance) {
    store.insert_instance(instance).await.unwrap();
    let mut provisioning = Operation::provisioning(
        format!("provisioning-{}", instance.instance_id),
        &instance.instance_id,
        instance.parameters.clone(),
    );
    provisioning.state = OperationState::Succeeded;
    provisioning.created_at = Utc::now() - Duration::hours(2);
    provisioning.updated_at = provisioning.created_at + Duration::minutes(10);
    provisioning.instance_details = instance.instance_details.clone();
    store.insert_operation(&provisioning).await.unwrap();
}

/// Insert `op` and return it as stored.
pub async fn insert(store: &Arc<dyn Persistence>, op: &Operation) -> Operation {
    store.insert_operation(op).await.unwrap();
    store.get_operation(&op.id).await.unwrap()
}
