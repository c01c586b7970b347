// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-plan runtime configuration.
//!
//! The configuration lives in a ConfigMap in `kcp-system`. Each data key is a
//! plan name whose value is a YAML document; the `default` key applies to
//! plans without their own entry.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use keb_clients::cluster::{ClusterClient, ClusterError, ResourceKind, from_dynamic};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Namespace of the runtime configuration ConfigMap.
pub const CONFIG_NAMESPACE: &str = "kcp-system";

/// Data key used when a plan has no entry of its own.
pub const DEFAULT_CONFIG_KEY: &str = "default";

/// Configuration of one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlanConfig {
    #[serde(rename = "kyma-template", default)]
    pub kyma_template: String,
}

#[derive(Debug, Error)]
pub enum PlanConfigError {
    #[error("configmap {0} with configuration does not exist")]
    ConfigMapNotFound(String),

    #[error("default configuration does not exist")]
    DefaultMissing,

    #[error("missing required configuration entries: kyma-template")]
    MissingKymaTemplate,

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_yaml::Error),

    #[error("while getting configuration configmap: {0}")]
    Cluster(#[from] ClusterError),
}

/// Source of per-plan configuration.
#[async_trait::async_trait]
pub trait PlanConfigProvider: Send + Sync {
    async fn for_plan(&self, plan_name: &str) -> Result<PlanConfig, PlanConfigError>;
}

/// Parse one plan's YAML document.
pub fn parse_plan_config(content: &str) -> Result<PlanConfig, PlanConfigError> {
    // Some deployment tools capitalise the key.
    let content = content.replace("Kind:", "kind:");
    let config: PlanConfig = serde_yaml::from_str(&content)?;
    if config.kyma_template.trim().is_empty() {
        return Err(PlanConfigError::MissingKymaTemplate);
    }
    Ok(config)
}

/// Reads the configuration from a control-plane ConfigMap.
pub struct ConfigMapPlanConfig {
    client: Arc<dyn ClusterClient>,
    name: String,
}

impl ConfigMapPlanConfig {
    pub fn new(client: Arc<dyn ClusterClient>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl PlanConfigProvider for ConfigMapPlanConfig {
    async fn for_plan(&self, plan_name: &str) -> Result<PlanConfig, PlanConfigError> {
        info!(plan = plan_name, "Getting runtime configuration for plan");
        let obj = match self
            .client
            .get(&ResourceKind::CONFIG_MAP, Some(CONFIG_NAMESPACE), &self.name)
            .await
        {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                return Err(PlanConfigError::ConfigMapNotFound(self.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let config_map: ConfigMap = from_dynamic(&obj)?;
        let data = config_map.data.unwrap_or_default();

        let content = match data.get(plan_name) {
            Some(content) => content,
            None => {
                info!(plan = plan_name, "No configuration for plan, using defaults");
                data.get(DEFAULT_CONFIG_KEY)
                    .ok_or(PlanConfigError::DefaultMissing)?
            }
        };
        parse_plan_config(content)
    }
}

/// Fixed configuration, keyed by plan name with an optional default.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanConfig {
    plans: HashMap<String, PlanConfig>,
}

impl StaticPlanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same template for every plan.
    pub fn with_default(kyma_template: impl Into<String>) -> Self {
        Self::new().with_plan(DEFAULT_CONFIG_KEY, kyma_template)
    }

    pub fn with_plan(mut self, plan_name: &str, kyma_template: impl Into<String>) -> Self {
        self.plans.insert(
            plan_name.to_string(),
            PlanConfig {
                kyma_template: kyma_template.into(),
            },
        );
        self
    }
}

#[async_trait::async_trait]
impl PlanConfigProvider for StaticPlanConfig {
    async fn for_plan(&self, plan_name: &str) -> Result<PlanConfig, PlanConfigError> {
        self.plans
            .get(plan_name)
            .or_else(|| self.plans.get(DEFAULT_CONFIG_KEY))
            .cloned()
            .ok_or(PlanConfigError::DefaultMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keb_clients::cluster::{FakeCluster, to_dynamic};
    use std::collections::BTreeMap;

    const DEFAULT_TEMPLATE: &str = "kyma-template: |-\n  apiVersion: operator.kyma-project.io/v1beta2\n  Kind: Kyma\n  metadata:\n    name: my-kyma1\n    namespace: kyma-system\n  spec:\n    channel: stable\n";

    async fn cluster_with(data: BTreeMap<String, String>) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("keb-runtime-config".to_string()),
                namespace: Some(CONFIG_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        cluster
            .insert(&ResourceKind::CONFIG_MAP, to_dynamic(&config_map).unwrap())
            .await;
        cluster
    }

    #[tokio::test]
    async fn test_default_config_is_used_for_unknown_plan() {
        let cluster = cluster_with(BTreeMap::from([
            (DEFAULT_CONFIG_KEY.to_string(), DEFAULT_TEMPLATE.to_string()),
            ("wrong".to_string(), "other: value".to_string()),
        ]))
        .await;
        let provider = ConfigMapPlanConfig::new(cluster, "keb-runtime-config");

        let config = provider.for_plan("aws").await.unwrap();
        assert!(config.kyma_template.contains("kind: Kyma"));
        assert!(config.kyma_template.contains("name: my-kyma1"));

        let err = provider.for_plan("wrong").await.unwrap_err();
        assert!(matches!(err, PlanConfigError::MissingKymaTemplate));
    }

    #[tokio::test]
    async fn test_missing_config_map() {
        let cluster = Arc::new(FakeCluster::new());
        let provider = ConfigMapPlanConfig::new(cluster, "keb-runtime-config");

        let err = provider.for_plan("aws").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "configmap keb-runtime-config with configuration does not exist"
        );
    }

    #[tokio::test]
    async fn test_missing_default() {
        let cluster = cluster_with(BTreeMap::from([(
            "azure".to_string(),
            DEFAULT_TEMPLATE.to_string(),
        )]))
        .await;
        let provider = ConfigMapPlanConfig::new(cluster, "keb-runtime-config");

        assert!(provider.for_plan("azure").await.is_ok());
        assert!(matches!(
            provider.for_plan("aws").await.unwrap_err(),
            PlanConfigError::DefaultMissing
        ));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticPlanConfig::with_default("default-template")
            .with_plan("trial", "trial-template");
        assert_eq!(
            provider.for_plan("trial").await.unwrap().kyma_template,
            "trial-template"
        );
        assert_eq!(
            provider.for_plan("aws").await.unwrap().kyma_template,
            "default-template"
        );
        assert!(StaticPlanConfig::new().for_plan("aws").await.is_err());
    }
}
