// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hyperscaler subscription accounting.
//!
//! Each paid runtime is backed by a cloud subscription handed out from a
//! pool of gardener `SecretBinding`s. When a runtime is gone its binding is
//! labelled `dirty=true` so the subscription cleanup can scrub and recycle it.

use std::fmt;
use std::sync::Arc;

use keb_core::ErrorKind;
use kube::core::DynamicObject;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::cluster::{ClusterClient, ClusterError, ResourceKind, label};

pub const HYPERSCALER_TYPE_LABEL: &str = "hyperscalerType";
pub const TENANT_NAME_LABEL: &str = "tenantName";
pub const DIRTY_LABEL: &str = "dirty";
pub const INTERNAL_LABEL: &str = "internal";
pub const EU_ACCESS_LABEL: &str = "euAccess";

/// Platform regions whose subscriptions are restricted to EU access.
const EU_RESTRICTED_PLATFORM_REGIONS: &[&str] = &["cf-eu11", "cf-ch20"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HyperscalerType {
    Aws,
    Azure,
    Gcp { platform_region: String },
    Openstack { region: String },
}

impl HyperscalerType {
    /// Resolve the type from an instance's provider and regions.
    pub fn from_provider(
        provider: &str,
        provider_region: &str,
        platform_region: &str,
    ) -> Result<Self, AccountPoolError> {
        match provider.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp {
                platform_region: platform_region.to_string(),
            }),
            "openstack" | "sapconvergedcloud" => Ok(Self::Openstack {
                region: provider_region.to_string(),
            }),
            _ => Err(AccountPoolError::UnknownProvider(provider.to_string())),
        }
    }

    /// Value of the `hyperscalerType` label on matching secret bindings.
    pub fn key(&self) -> String {
        match self {
            Self::Aws => "aws".to_string(),
            Self::Azure => "azure".to_string(),
            Self::Gcp { platform_region } if platform_region == "cf-sa30" => {
                "gcp_cf-sa30".to_string()
            }
            Self::Gcp { .. } => "gcp".to_string(),
            Self::Openstack { region } if !region.is_empty() => format!("openstack_{region}"),
            Self::Openstack { .. } => "openstack".to_string(),
        }
    }
}

impl fmt::Display for HyperscalerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn is_eu_restricted_access(platform_region: &str) -> bool {
    EU_RESTRICTED_PLATFORM_REGIONS.contains(&platform_region)
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AccountPoolError {
    #[error("unknown cloud provider: {0:?}")]
    UnknownProvider(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl AccountPoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountPoolError::UnknownProvider(_) => ErrorKind::Permanent,
            AccountPoolError::Cluster(e) => e.kind(),
        }
    }
}

#[async_trait::async_trait]
pub trait AccountProvider: Send + Sync {
    /// Flag the tenant's subscription for cleanup unless it is internal,
    /// already flagged or still used by a shoot.
    async fn mark_unused_secret_binding_as_dirty(
        &self,
        hyperscaler_type: &HyperscalerType,
        tenant_name: &str,
        eu_access: bool,
    ) -> Result<(), AccountPoolError>;
}

/// Account pool backed by `SecretBinding`s in a gardener project namespace.
pub struct GardenerAccountPool {
    gardener: Arc<dyn ClusterClient>,
    namespace: String,
}

impl GardenerAccountPool {
    pub fn new(gardener: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            gardener,
            namespace: namespace.into(),
        }
    }

    fn selector(hyperscaler_type: &HyperscalerType, tenant_name: &str, eu_access: bool) -> String {
        let eu = if eu_access {
            format!("{EU_ACCESS_LABEL}=true")
        } else {
            format!("!{EU_ACCESS_LABEL}")
        };
        format!(
            "{TENANT_NAME_LABEL}={tenant_name},{HYPERSCALER_TYPE_LABEL}={},{eu}",
            hyperscaler_type.key()
        )
    }

    async fn is_used(&self, binding_name: &str) -> Result<bool, ClusterError> {
        let shoots = self
            .gardener
            .list(&ResourceKind::SHOOT, Some(&self.namespace), None)
            .await?;
        Ok(shoots
            .iter()
            .any(|shoot| secret_binding_name(shoot) == Some(binding_name)))
    }
}

fn secret_binding_name(shoot: &DynamicObject) -> Option<&str> {
    shoot.data.get("spec")?.get("secretBindingName")?.as_str()
}

#[async_trait::async_trait]
impl AccountProvider for GardenerAccountPool {
    async fn mark_unused_secret_binding_as_dirty(
        &self,
        hyperscaler_type: &HyperscalerType,
        tenant_name: &str,
        eu_access: bool,
    ) -> Result<(), AccountPoolError> {
        let selector = Self::selector(hyperscaler_type, tenant_name, eu_access);
        let bindings = self
            .gardener
            .list(
                &ResourceKind::SECRET_BINDING,
                Some(&self.namespace),
                Some(&selector),
            )
            .await?;

        let Some(mut binding) = bindings.into_iter().next() else {
            return Ok(());
        };
        if label(&binding, INTERNAL_LABEL) == Some("true") || label(&binding, DIRTY_LABEL) == Some("true")
        {
            return Ok(());
        }

        let name = binding.metadata.name.clone().unwrap_or_default();
        if self.is_used(&name).await? {
            return Ok(());
        }

        binding
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(DIRTY_LABEL.to_string(), "true".to_string());
        self.gardener
            .replace(&ResourceKind::SECRET_BINDING, &binding)
            .await?;
        info!(
            secret_binding = %name,
            tenant_name,
            hyperscaler_type = %hyperscaler_type,
            "Secret binding marked as dirty"
        );
        Ok(())
    }
}

/// Records release requests. `fail_temporarily(n)` makes the next `n` calls
/// fail with a transport error.
#[derive(Clone, Default)]
pub struct FakeAccountProvider {
    released: Arc<Mutex<Vec<(String, String, bool)>>>,
    failures: Arc<Mutex<u32>>,
}

impl FakeAccountProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_temporarily(&self, times: u32) {
        *self.failures.lock().await = times;
    }

    /// `(hyperscaler key, tenant, eu_access)` per successful call.
    pub async fn released(&self) -> Vec<(String, String, bool)> {
        self.released.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AccountProvider for FakeAccountProvider {
    async fn mark_unused_secret_binding_as_dirty(
        &self,
        hyperscaler_type: &HyperscalerType,
        tenant_name: &str,
        eu_access: bool,
    ) -> Result<(), AccountPoolError> {
        {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(ClusterError::Transport("gardener unavailable".to_string()).into());
            }
        }
        self.released.lock().await.push((
            hyperscaler_type.key(),
            tenant_name.to_string(),
            eu_access,
        ));
        Ok(())
    }
}
