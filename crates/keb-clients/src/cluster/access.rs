// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant-cluster access through kubeconfig secrets on the control plane.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use keb_core::ErrorKind;
use thiserror::Error;
use tracing::debug;

use super::{ClusterClient, ClusterError, KubeClusterClient, ResourceKind, from_dynamic};

/// Namespace on the control plane holding per-runtime kubeconfig secrets.
pub const KUBECONFIG_NAMESPACE: &str = "kcp-system";

/// Data key of the kubeconfig inside its secret.
pub const KUBECONFIG_SECRET_KEY: &str = "config";

pub fn kubeconfig_secret_name(runtime_id: &str) -> String {
    format!("kubeconfig-{runtime_id}")
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterAccessError {
    /// No kubeconfig is stored for the runtime; the cluster is gone or was
    /// never created.
    #[error("kubeconfig for runtime {runtime_id} not found")]
    KubeconfigNotFound { runtime_id: String },

    #[error("kubeconfig for runtime {runtime_id} is invalid: {message}")]
    InvalidKubeconfig { runtime_id: String, message: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl ClusterAccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterAccessError::KubeconfigNotFound { .. } => ErrorKind::NotFound,
            ClusterAccessError::InvalidKubeconfig { .. } => ErrorKind::Permanent,
            ClusterAccessError::Cluster(e) => e.kind(),
        }
    }

    pub fn is_kubeconfig_not_found(&self) -> bool {
        matches!(self, ClusterAccessError::KubeconfigNotFound { .. })
    }
}

/// Hands out clients for tenant clusters by runtime id.
#[async_trait::async_trait]
pub trait ClusterAccessProvider: Send + Sync {
    async fn client_for(&self, runtime_id: &str)
    -> Result<Arc<dyn ClusterClient>, ClusterAccessError>;
}

/// Reads `kcp-system/kubeconfig-<runtime-id>` from the control plane and
/// builds a [`KubeClusterClient`] from it.
pub struct KubeconfigAccessProvider {
    control_plane: Arc<dyn ClusterClient>,
    timeout: Duration,
}

impl KubeconfigAccessProvider {
    pub fn new(control_plane: Arc<dyn ClusterClient>, timeout: Duration) -> Self {
        Self {
            control_plane,
            timeout,
        }
    }

    /// Raw kubeconfig of a runtime.
    pub async fn kubeconfig(&self, runtime_id: &str) -> Result<String, ClusterAccessError> {
        let name = kubeconfig_secret_name(runtime_id);
        let obj = match self
            .control_plane
            .get(&ResourceKind::SECRET, Some(KUBECONFIG_NAMESPACE), &name)
            .await
        {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                return Err(ClusterAccessError::KubeconfigNotFound {
                    runtime_id: runtime_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let secret: Secret = from_dynamic(&obj)?;
        let bytes = secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| ClusterAccessError::KubeconfigNotFound {
                runtime_id: runtime_id.to_string(),
            })?;

        String::from_utf8(bytes.0).map_err(|e| ClusterAccessError::InvalidKubeconfig {
            runtime_id: runtime_id.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ClusterAccessProvider for KubeconfigAccessProvider {
    async fn client_for(
        &self,
        runtime_id: &str,
    ) -> Result<Arc<dyn ClusterClient>, ClusterAccessError> {
        let kubeconfig = self.kubeconfig(runtime_id).await?;
        debug!(runtime_id, "Building tenant cluster client");
        let client = KubeClusterClient::from_kubeconfig_yaml(&kubeconfig, self.timeout)
            .await
            .map_err(|e| ClusterAccessError::InvalidKubeconfig {
                runtime_id: runtime_id.to_string(),
                message: e.to_string(),
            })?;
        Ok(Arc::new(client))
    }
}
