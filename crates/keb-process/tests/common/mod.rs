// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for keb-process integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use keb_clients::cluster::{FakeCluster, FakeClusterAccessProvider};
use keb_clients::edp::FakeEdpClient;
use keb_clients::hyperscaler::FakeAccountProvider;
use keb_clients::provisioner::{FakeProvisionerClient, ProvisionerClient};
use keb_core::FieldCipher;
use keb_core::model::{
    ErsContext, Instance, InstanceDetails, Operation, OperationState, ProvisioningParameters,
    ServiceManagerOperatorCredentials,
};
use keb_core::persistence::{Persistence, SqlitePersistence};
use keb_core::plans;
use keb_process::config::StepSwitch;
use keb_process::deprovisioning::{Collaborators, PipelineConfig, build_pipeline};
use keb_process::plan_config::StaticPlanConfig;
use keb_process::staged_manager::StagedManager;

pub const GLOBAL_ACCOUNT_ID: &str = "ga-1";
pub const SUBACCOUNT_ID: &str = "sa-1";

pub const KYMA_TEMPLATE: &str = "apiVersion: operator.kyma-project.io/v1beta2
kind: Kyma
metadata:
  name: tbd
  namespace: kcp-system
spec:
  channel: regular
";

pub async fn store() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory(FieldCipher::new("integration-test-key"))
            .await
            .expect("Failed to create in-memory store"),
    )
}

pub fn parameters(plan_id: &str) -> ProvisioningParameters {
    ProvisioningParameters {
        plan_id: plan_id.to_string(),
        service_id: plans::KYMA_SERVICE_ID.to_string(),
        ers_context: ErsContext {
            global_account_id: Some(GLOBAL_ACCOUNT_ID.to_string()),
            subaccount_id: Some(SUBACCOUNT_ID.to_string()),
            user_id: Some("john.smith@example.com".to_string()),
            ..Default::default()
        },
        platform_region: "cf-eu10".to_string(),
        platform_provider: "AWS".to_string(),
        ..Default::default()
    }
}

pub fn instance(instance_id: &str, runtime_id: &str, plan_id: &str) -> Instance {
    let mut instance = Instance::new(instance_id, plan_id);
    instance.runtime_id = runtime_id.to_string();
    instance.global_account_id = GLOBAL_ACCOUNT_ID.to_string();
    instance.subaccount_id = SUBACCOUNT_ID.to_string();
    instance.provider = "AWS".to_string();
    instance.provider_region = "eu-central-1".to_string();
    instance.parameters = parameters(plan_id);
    instance.instance_details = InstanceDetails {
        runtime_id: runtime_id.to_string(),
        subaccount_id: SUBACCOUNT_ID.to_string(),
        shoot_name: format!("c-{instance_id}"),
        kyma_resource_namespace: "kcp-system".to_string(),
        ..Default::default()
    };
    instance
}

/// Insert `instance` with a provisioning that finished two hours ago.
pub async fn seed_instance(store: &Arc<dyn Persistence>, instance: &Instance) {
    store
        .insert_instance(instance)
        .await
        .expect("Failed to insert instance");
    let mut provisioning = Operation::provisioning(
        format!("provisioning-{}", instance.instance_id),
        &instance.instance_id,
        instance.parameters.clone(),
    );
    provisioning.state = OperationState::Succeeded;
    provisioning.created_at = Utc::now() - Duration::hours(2);
    provisioning.updated_at = provisioning.created_at + Duration::minutes(10);
    provisioning.instance_details = instance.instance_details.clone();
    store
        .insert_operation(&provisioning)
        .await
        .expect("Failed to insert provisioning operation");
}

/// Instance with service-manager credentials on a registered fake cluster.
pub async fn seed_with_credentials(
    store: &Arc<dyn Persistence>,
    clusters: &FakeClusterAccessProvider,
    n: usize,
) -> Arc<FakeCluster> {
    let runtime_id = format!("runtime-{n}");
    let mut instance = instance(&format!("inst-{n}"), &runtime_id, plans::AWS_PLAN_ID);
    instance.parameters.ers_context.sm_operator_credentials = Some(ServiceManagerOperatorCredentials {
        client_id: format!("client-{n}"),
        client_secret: format!("secret-{n}"),
        sm_url: "https://service-manager.example.com".to_string(),
        url: "https://token.example.com".to_string(),
        xsappname: "app".to_string(),
    });
    instance.instance_details.sm_cluster_id = format!("cluster-{n}");
    seed_instance(store, &instance).await;
    clusters.register(&runtime_id).await
}

/// Fakes behind a deprovisioning pipeline.
pub struct PipelineEnv {
    pub store: Arc<dyn Persistence>,
    pub kcp: Arc<FakeCluster>,
    pub clusters: FakeClusterAccessProvider,
    pub provisioner: Arc<FakeProvisionerClient>,
    pub edp: Arc<FakeEdpClient>,
    pub accounts: Arc<FakeAccountProvider>,
}

impl PipelineEnv {
    pub async fn new() -> Self {
        Self {
            store: store().await,
            kcp: Arc::new(FakeCluster::new()),
            clusters: FakeClusterAccessProvider::new(),
            provisioner: Arc::new(FakeProvisionerClient::new()),
            edp: Arc::new(FakeEdpClient::new()),
            accounts: Arc::new(FakeAccountProvider::new()),
        }
    }

    pub fn config() -> PipelineConfig {
        PipelineConfig {
            archive: StepSwitch {
                enabled: true,
                dry_run: false,
            },
            cleaning: StepSwitch {
                enabled: true,
                dry_run: false,
            },
            ..Default::default()
        }
    }

    /// Pipeline with sleeps sped up a thousandfold.
    pub fn pipeline(&self, config: &PipelineConfig, with_provisioner: bool) -> StagedManager {
        let provisioner: Option<Arc<dyn ProvisionerClient>> = if with_provisioner {
            Some(self.provisioner.clone())
        } else {
            None
        };
        let collaborators = Collaborators {
            storage: self.store.clone(),
            kcp: self.kcp.clone(),
            cluster_access: Arc::new(self.clusters.clone()),
            plan_config: Arc::new(StaticPlanConfig::with_default(KYMA_TEMPLATE)),
            provisioner,
            edp: self.edp.clone(),
            accounts: self.accounts.clone(),
        };
        let mut pipeline =
            build_pipeline(collaborators, config).expect("Failed to build pipeline");
        pipeline.speed_up(1000);
        pipeline
    }
}
