// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removal of stale shoots on development landscapes.
//!
//! Shoots older than the configured age are sorted into three groups:
//!
//! - backed by an instance: deprovisioned through the broker, so the regular
//!   pipeline tears everything down;
//! - backed only by a Runtime resource: the resource is deleted and the
//!   infrastructure manager removes the shoot;
//! - orphans without runtime metadata: confirmed for deletion and deleted in
//!   Gardener directly.
//!
//! The job refuses to touch anything unless the landscape reports the
//! expected domain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keb_clients::broker::BrokerClient;
use keb_clients::cluster::{ClusterClient, ResourceKind, annotation, label};
use keb_core::Persistence;
use keb_core::model::Instance;
use keb_core::persistence::InstanceFilter;
use kube::core::DynamicObject;
use tracing::{error, info, warn};

use crate::config::{EnvironmentsCleanupConfig, gardener_namespace};
use crate::error::{Error, Result};

pub const RUNTIME_ID_ANNOTATION: &str = "kcp.provisioner.kyma-project.io/runtime-id";
pub const INFRASTRUCTURE_MANAGER_RUNTIME_ID_ANNOTATION: &str =
    "infrastructuremanager.kyma-project.io/runtime-id";
pub const ACCOUNT_LABEL: &str = "account";
pub const DELETION_CONFIRMATION_ANNOTATION: &str = "confirmation.gardener.cloud/deletion";

const KCP_NAMESPACE: &str = "kcp-system";

/// Cleanup parameters.
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub max_age: Duration,
    pub label_selector: String,
    /// Namespace of the Gardener project holding the shoots.
    pub gardener_namespace: String,
    pub expected_domain: Option<String>,
    pub environment_configmap: (String, String),
    pub environment_domain_key: String,
}

impl From<&EnvironmentsCleanupConfig> for CleanupSettings {
    fn from(config: &EnvironmentsCleanupConfig) -> Self {
        Self {
            max_age: config.max_age,
            label_selector: config.label_selector.clone(),
            gardener_namespace: gardener_namespace(&config.gardener_project),
            expected_domain: config.expected_domain.clone(),
            environment_configmap: config.environment_configmap.clone(),
            environment_domain_key: config.environment_domain_key.clone(),
        }
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub instances_deprovisioned: usize,
    pub runtimes_deleted: usize,
    pub shoots_deleted: usize,
}

/// A stale shoot that carries runtime metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StaleRuntime {
    runtime_id: String,
    account_id: String,
    shoot_name: String,
}

fn shoot_name(shoot: &DynamicObject) -> &str {
    shoot.metadata.name.as_deref().unwrap_or_default()
}

/// Runtime metadata of a shoot, `None` for shoots not created through KCP.
fn shoot_to_runtime(shoot: &DynamicObject) -> Option<StaleRuntime> {
    let runtime_id = annotation(shoot, RUNTIME_ID_ANNOTATION)
        .or_else(|| annotation(shoot, INFRASTRUCTURE_MANAGER_RUNTIME_ID_ANNOTATION))?;
    let account_id = label(shoot, ACCOUNT_LABEL)?;
    Some(StaleRuntime {
        runtime_id: runtime_id.to_string(),
        account_id: account_id.to_string(),
        shoot_name: shoot_name(shoot).to_string(),
    })
}

fn shoot_age(shoot: &DynamicObject) -> Duration {
    shoot
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|created| (Utc::now() - created.0).to_std().ok())
        .unwrap_or_default()
}

/// Shoot name a Runtime resource points at.
fn runtime_shoot_name(runtime: &DynamicObject) -> Option<&str> {
    runtime.data.get("spec")?.get("shoot")?.get("name")?.as_str()
}

pub struct EnvironmentsCleanup {
    gardener: Arc<dyn ClusterClient>,
    kcp: Arc<dyn ClusterClient>,
    broker: Arc<dyn BrokerClient>,
    storage: Arc<dyn Persistence>,
    settings: CleanupSettings,
}

impl EnvironmentsCleanup {
    pub fn new(
        gardener: Arc<dyn ClusterClient>,
        kcp: Arc<dyn ClusterClient>,
        broker: Arc<dyn BrokerClient>,
        storage: Arc<dyn Persistence>,
        settings: CleanupSettings,
    ) -> Self {
        Self {
            gardener,
            kcp,
            broker,
            storage,
            settings,
        }
    }

    /// Fail unless the landscape's configuration map reports the expected
    /// domain.
    pub async fn verify_environment(&self) -> Result<()> {
        let Some(expected) = self.settings.expected_domain.as_deref() else {
            return Err(Error::Fatal(
                "expected environment domain is not configured, refusing to run".to_string(),
            ));
        };
        let (namespace, name) = &self.settings.environment_configmap;
        let configmap = self
            .kcp
            .get(&ResourceKind::CONFIG_MAP, Some(namespace), name)
            .await?;
        let domain = configmap
            .data
            .get("data")
            .and_then(|data| data.get(&self.settings.environment_domain_key))
            .and_then(|domain| domain.as_str());
        match domain {
            Some(domain) if domain == expected => Ok(()),
            Some(domain) => Err(Error::Fatal(format!(
                "environment domain {domain} does not match {expected}, refusing to run"
            ))),
            None => Err(Error::Fatal(format!(
                "configmap {namespace}/{name} has no {} entry, refusing to run",
                self.settings.environment_domain_key
            ))),
        }
    }

    /// One cleanup pass. Failures of individual deprovisionings and Runtime
    /// deletions are collected and returned together after all shoots were
    /// processed.
    pub async fn run(&self) -> Result<CleanupReport> {
        self.verify_environment().await?;

        let (runtimes, orphans) = self.stale_shoots().await?;
        info!(
            runtimes = runtimes.len(),
            orphans = orphans.len(),
            max_age_hours = self.settings.max_age.as_secs() / 3600,
            "Stale shoots found"
        );

        let mut report = CleanupReport::default();
        let mut errors = Vec::new();
        if !runtimes.is_empty() {
            self.cleanup_runtimes(&runtimes, &mut report, &mut errors)
                .await?;
        }
        self.cleanup_orphans(orphans, &mut report).await;

        info!(
            instances_deprovisioned = report.instances_deprovisioned,
            runtimes_deleted = report.runtimes_deleted,
            shoots_deleted = report.shoots_deleted,
            errors = errors.len(),
            "Environments cleanup finished"
        );
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(Error::Aggregate(errors))
        }
    }

    async fn stale_shoots(&self) -> Result<(Vec<StaleRuntime>, Vec<DynamicObject>)> {
        let selector =
            (!self.settings.label_selector.is_empty()).then_some(self.settings.label_selector.as_str());
        let shoots = self
            .gardener
            .list(
                &ResourceKind::SHOOT,
                Some(&self.settings.gardener_namespace),
                selector,
            )
            .await?;

        let mut runtimes = Vec::new();
        let mut orphans = Vec::new();
        for shoot in shoots {
            let age = shoot_age(&shoot);
            if age < self.settings.max_age {
                info!(
                    shoot = shoot_name(&shoot),
                    age_hours = age.as_secs() / 3600,
                    "Shoot is not old enough"
                );
                continue;
            }
            match shoot_to_runtime(&shoot) {
                Some(runtime) => runtimes.push(runtime),
                None => {
                    info!(shoot = shoot_name(&shoot), "Found a shoot without KCP metadata");
                    orphans.push(shoot);
                }
            }
        }
        Ok((runtimes, orphans))
    }

    async fn cleanup_runtimes(
        &self,
        runtimes: &[StaleRuntime],
        report: &mut CleanupReport,
        errors: &mut Vec<Error>,
    ) -> Result<()> {
        let filter = InstanceFilter {
            runtime_ids: runtimes.iter().map(|r| r.runtime_id.clone()).collect(),
            ..Default::default()
        };
        let instances: HashMap<String, Instance> = self
            .storage
            .list_instances(&filter)
            .await?
            .into_iter()
            .map(|instance| (instance.runtime_id.clone(), instance))
            .collect();

        for runtime in runtimes {
            match instances.get(&runtime.runtime_id) {
                Some(instance) if shoot_matches(instance, runtime) => {
                    match self.deprovision(instance).await {
                        Ok(()) => report.instances_deprovisioned += 1,
                        Err(e) => errors.push(e),
                    }
                }
                Some(instance) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        shoot = %runtime.shoot_name,
                        instance_shoot = %instance.instance_details.shoot_name,
                        "Shoot name does not match the instance, skipping"
                    );
                }
                None => match self.delete_runtime_resource(runtime).await {
                    Ok(true) => report.runtimes_deleted += 1,
                    Ok(false) => {}
                    Err(e) => errors.push(e),
                },
            }
        }
        Ok(())
    }

    async fn deprovision(&self, instance: &Instance) -> Result<()> {
        info!(instance_id = %instance.instance_id, "Triggering environment deprovisioning");
        let operation_id = self
            .broker
            .deprovision(&instance.instance_id, &instance.service_plan_id)
            .await
            .inspect_err(|e| {
                error!(
                    instance_id = %instance.instance_id,
                    error = %e,
                    "Triggering deprovisioning failed"
                );
            })?;
        info!(
            instance_id = %instance.instance_id,
            operation_id = %operation_id,
            "Deprovisioning request accepted by the broker"
        );
        Ok(())
    }

    /// Delete the Runtime resource of a shoot without an instance. Returns
    /// whether a resource was deleted; a missing or mismatching resource is
    /// only logged.
    async fn delete_runtime_resource(&self, runtime: &StaleRuntime) -> Result<bool> {
        let name = runtime.runtime_id.to_lowercase();
        let resource = match self
            .kcp
            .get(&ResourceKind::RUNTIME, Some(KCP_NAMESPACE), &name)
            .await
        {
            Ok(resource) => resource,
            Err(e) => {
                warn!(
                    runtime_id = %runtime.runtime_id,
                    error = %e,
                    "Cannot get Runtime resource"
                );
                return Ok(false);
            }
        };
        let target = runtime_shoot_name(&resource).unwrap_or_default();
        if target != runtime.shoot_name {
            warn!(
                runtime_id = %runtime.runtime_id,
                shoot = %runtime.shoot_name,
                runtime_shoot = target,
                "Gardener shoot name does not match Runtime resource"
            );
            return Ok(false);
        }

        info!(
            runtime_id = %runtime.runtime_id,
            account = %runtime.account_id,
            "Deleting Runtime resource"
        );
        self.kcp
            .delete(&ResourceKind::RUNTIME, Some(KCP_NAMESPACE), &name)
            .await
            .inspect_err(|e| {
                error!(runtime_id = %runtime.runtime_id, error = %e, "Deleting Runtime resource failed");
            })?;
        Ok(true)
    }

    /// Confirm and delete shoots without KCP metadata. Failures are logged.
    async fn cleanup_orphans(&self, shoots: Vec<DynamicObject>, report: &mut CleanupReport) {
        for mut shoot in shoots {
            let name = shoot_name(&shoot).to_string();
            shoot
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(DELETION_CONFIRMATION_ANNOTATION.to_string(), "true".to_string());
            if let Err(e) = self.gardener.replace(&ResourceKind::SHOOT, &shoot).await {
                error!(shoot = %name, error = %e, "Annotating shoot with deletion confirmation failed");
            }
            match self
                .gardener
                .delete(
                    &ResourceKind::SHOOT,
                    Some(&self.settings.gardener_namespace),
                    &name,
                )
                .await
            {
                Ok(()) => {
                    info!(shoot = %name, "Shoot deleted");
                    report.shoots_deleted += 1;
                }
                Err(e) => error!(shoot = %name, error = %e, "Deleting shoot failed"),
            }
        }
    }
}

fn shoot_matches(instance: &Instance, runtime: &StaleRuntime) -> bool {
    let recorded = &instance.instance_details.shoot_name;
    recorded.is_empty() || *recorded == runtime.shoot_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use keb_clients::broker::FakeBrokerClient;
    use keb_clients::cluster::FakeCluster;
    use keb_core::FieldCipher;
    use keb_core::persistence::SqlitePersistence;
    use keb_core::plans;
    use serde_json::json;

    const NAMESPACE: &str = "garden-kyma-dev";

    struct Env {
        gardener: Arc<FakeCluster>,
        kcp: Arc<FakeCluster>,
        broker: FakeBrokerClient,
        storage: Arc<dyn Persistence>,
    }

    impl Env {
        async fn new() -> Self {
            let gardener = Arc::new(FakeCluster::new());
            gardener.install(&ResourceKind::SHOOT).await;
            let kcp = Arc::new(FakeCluster::new());
            kcp.install(&ResourceKind::RUNTIME).await;
            let mut configmap = ResourceKind::CONFIG_MAP.object(Some(KCP_NAMESPACE), "keb-environment");
            configmap.data = json!({"data": {"domain": "dev.kyma.ondemand.com"}});
            kcp.insert(&ResourceKind::CONFIG_MAP, configmap).await;
            let storage: Arc<dyn Persistence> = Arc::new(
                SqlitePersistence::in_memory(FieldCipher::disabled())
                    .await
                    .unwrap(),
            );
            Self {
                gardener,
                kcp,
                broker: FakeBrokerClient::new(),
                storage,
            }
        }

        fn cleanup(&self, settings: CleanupSettings) -> EnvironmentsCleanup {
            EnvironmentsCleanup::new(
                self.gardener.clone(),
                self.kcp.clone(),
                Arc::new(self.broker.clone()),
                self.storage.clone(),
                settings,
            )
        }

        async fn shoot(&self, name: &str, age_hours: i64, runtime_id: Option<&str>) {
            let mut shoot = ResourceKind::SHOOT.object(Some(NAMESPACE), name);
            shoot.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::hours(age_hours)));
            if let Some(runtime_id) = runtime_id {
                shoot.metadata.annotations = Some(BTreeMap::from([(
                    RUNTIME_ID_ANNOTATION.to_string(),
                    runtime_id.to_string(),
                )]));
                shoot.metadata.labels = Some(BTreeMap::from([(
                    ACCOUNT_LABEL.to_string(),
                    "ga-1".to_string(),
                )]));
            }
            self.gardener.insert(&ResourceKind::SHOOT, shoot).await;
        }

        async fn runtime_resource(&self, runtime_id: &str, shoot: &str) {
            let mut runtime = ResourceKind::RUNTIME.object(Some(KCP_NAMESPACE), runtime_id);
            runtime.data = json!({"spec": {"shoot": {"name": shoot}}});
            self.kcp.insert(&ResourceKind::RUNTIME, runtime).await;
        }

        async fn instance(&self, instance_id: &str, runtime_id: &str) {
            let mut instance = Instance::new(instance_id, plans::AWS_PLAN_ID);
            instance.runtime_id = runtime_id.to_string();
            self.storage.insert_instance(&instance).await.unwrap();
        }
    }

    fn settings() -> CleanupSettings {
        CleanupSettings {
            max_age: Duration::from_secs(24 * 3600),
            label_selector: "owner.do-not-delete!=true".to_string(),
            gardener_namespace: NAMESPACE.to_string(),
            expected_domain: Some("dev.kyma.ondemand.com".to_string()),
            environment_configmap: (KCP_NAMESPACE.to_string(), "keb-environment".to_string()),
            environment_domain_key: "domain".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatches_each_kind_of_stale_shoot() {
        let env = Env::new().await;
        env.shoot("with-instance", 30, Some("runtime-1")).await;
        env.instance("inst-1", "runtime-1").await;
        env.shoot("with-runtime", 30, Some("runtime-2")).await;
        env.runtime_resource("runtime-2", "with-runtime").await;
        env.shoot("orphan", 30, None).await;
        env.shoot("young", 2, None).await;

        let report = env.cleanup(settings()).run().await.unwrap();

        assert_eq!(
            report,
            CleanupReport {
                instances_deprovisioned: 1,
                runtimes_deleted: 1,
                shoots_deleted: 1,
            }
        );
        assert_eq!(
            env.broker.requests().await,
            vec![("inst-1".to_string(), plans::AWS_PLAN_ID.to_string())]
        );
        assert!(env.kcp.object(&ResourceKind::RUNTIME, Some(KCP_NAMESPACE), "runtime-2").await.is_none());
        assert!(env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "orphan").await.is_none());
        assert!(env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "young").await.is_some());
        // Backed shoots are left to the broker and the infrastructure manager.
        assert!(env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "with-instance").await.is_some());
    }

    #[tokio::test]
    async fn test_orphan_is_confirmed_before_deletion() {
        let env = Env::new().await;
        env.shoot("orphan", 30, None).await;
        let mut finalized = env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "orphan").await.unwrap();
        finalized.metadata.finalizers = Some(vec!["gardener".to_string()]);
        env.gardener.insert(&ResourceKind::SHOOT, finalized).await;

        env.cleanup(settings()).run().await.unwrap();

        let shoot = env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "orphan").await.unwrap();
        assert_eq!(annotation(&shoot, DELETION_CONFIRMATION_ANNOTATION), Some("true"));
        assert!(shoot.metadata.deletion_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_protected_shoots_are_not_listed() {
        let env = Env::new().await;
        env.shoot("protected", 30, None).await;
        let mut shoot = env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "protected").await.unwrap();
        shoot.metadata.labels = Some(BTreeMap::from([(
            "owner.do-not-delete".to_string(),
            "true".to_string(),
        )]));
        env.gardener.insert(&ResourceKind::SHOOT, shoot).await;

        let report = env.cleanup(settings()).run().await.unwrap();

        assert_eq!(report, CleanupReport::default());
        assert_eq!(env.gardener.count(&ResourceKind::SHOOT).await, 1);
    }

    #[tokio::test]
    async fn test_runtime_resource_for_another_shoot_is_kept() {
        let env = Env::new().await;
        env.shoot("shoot-a", 30, Some("runtime-1")).await;
        env.runtime_resource("runtime-1", "shoot-b").await;
        env.shoot("shoot-c", 30, Some("runtime-missing")).await;

        let report = env.cleanup(settings()).run().await.unwrap();

        assert_eq!(report.runtimes_deleted, 0);
        assert_eq!(env.kcp.count(&ResourceKind::RUNTIME).await, 1);
    }

    #[tokio::test]
    async fn test_refuses_to_run_on_unexpected_domain() {
        let env = Env::new().await;
        env.shoot("orphan", 30, None).await;

        let mut wrong = settings();
        wrong.expected_domain = Some("kyma.ondemand.com".to_string());
        let err = env.cleanup(wrong).run().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));

        let mut unset = settings();
        unset.expected_domain = None;
        let err = env.cleanup(unset).run().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));

        assert_eq!(env.gardener.count(&ResourceKind::SHOOT).await, 1);
        assert!(env.gardener.deletes().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_configmap_stops_the_run() {
        let env = Env::new().await;
        env.kcp.delete(&ResourceKind::CONFIG_MAP, Some(KCP_NAMESPACE), "keb-environment").await.unwrap();

        let err = env.cleanup(settings()).run().await.unwrap_err();

        assert!(matches!(err, Error::Cluster(_)));
    }

    #[tokio::test]
    async fn test_runtime_deletion_failures_are_aggregated() {
        let env = Env::new().await;
        env.shoot("with-runtime", 30, Some("runtime-2")).await;
        env.runtime_resource("runtime-2", "with-runtime").await;
        env.shoot("orphan", 30, None).await;
        // Reads succeed, the delete is rejected.
        let kcp = env.kcp.clone();
        let failing = FailingDeletes { inner: kcp };
        let cleanup = EnvironmentsCleanup::new(
            env.gardener.clone(),
            Arc::new(failing),
            Arc::new(env.broker.clone()),
            env.storage.clone(),
            settings(),
        );

        let err = cleanup.run().await.unwrap_err();

        assert!(matches!(err, Error::Aggregate(ref errors) if errors.len() == 1));
        // The orphan is still handled.
        assert!(env.gardener.object(&ResourceKind::SHOOT, Some(NAMESPACE), "orphan").await.is_none());
    }

    struct FailingDeletes {
        inner: Arc<FakeCluster>,
    }

    #[async_trait::async_trait]
    impl ClusterClient for FailingDeletes {
        async fn get(
            &self,
            kind: &ResourceKind,
            namespace: Option<&str>,
            name: &str,
        ) -> std::result::Result<DynamicObject, keb_clients::cluster::ClusterError> {
            self.inner.get(kind, namespace, name).await
        }

        async fn list(
            &self,
            kind: &ResourceKind,
            namespace: Option<&str>,
            label_selector: Option<&str>,
        ) -> std::result::Result<Vec<DynamicObject>, keb_clients::cluster::ClusterError> {
            self.inner.list(kind, namespace, label_selector).await
        }

        async fn create(
            &self,
            kind: &ResourceKind,
            obj: &DynamicObject,
        ) -> std::result::Result<DynamicObject, keb_clients::cluster::ClusterError> {
            self.inner.create(kind, obj).await
        }

        async fn replace(
            &self,
            kind: &ResourceKind,
            obj: &DynamicObject,
        ) -> std::result::Result<DynamicObject, keb_clients::cluster::ClusterError> {
            self.inner.replace(kind, obj).await
        }

        async fn delete(
            &self,
            _kind: &ResourceKind,
            _namespace: Option<&str>,
            _name: &str,
        ) -> std::result::Result<(), keb_clients::cluster::ClusterError> {
            Err(keb_clients::cluster::ClusterError::Api {
                code: 403,
                message: "forbidden".to_string(),
            })
        }

        async fn delete_collection(
            &self,
            kind: &ResourceKind,
            namespace: &str,
        ) -> std::result::Result<(), keb_clients::cluster::ClusterError> {
            self.inner.delete_collection(kind, namespace).await
        }
    }
}
