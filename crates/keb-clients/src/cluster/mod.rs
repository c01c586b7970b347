// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster access.
//!
//! All cluster traffic goes through the [`ClusterClient`] trait over
//! [`DynamicObject`]s, so the same code drives the control-plane cluster,
//! tenant clusters and the in-memory [`FakeCluster`]. Typed `k8s-openapi`
//! resources are converted with [`to_dynamic`] and [`from_dynamic`].

mod access;
mod fake;
mod kubernetes;

pub use access::{
    ClusterAccessError, ClusterAccessProvider, KUBECONFIG_NAMESPACE, KUBECONFIG_SECRET_KEY,
    KubeconfigAccessProvider, kubeconfig_secret_name,
};
pub use fake::{FakeCluster, FakeClusterAccessProvider};
pub use kubernetes::KubeClusterClient;

use std::borrow::Cow;
use std::time::Duration;

use keb_core::ErrorKind;
use kube::core::{ApiResource, DynamicObject};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Timeout applied to single cluster calls unless configured otherwise.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Group, version and kind of a resource plus what the API path needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub kind: Cow<'static, str>,
    pub plural: Cow<'static, str>,
    pub namespaced: bool,
}

impl ResourceKind {
    pub const fn new(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
        namespaced: bool,
    ) -> Self {
        Self {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            kind: Cow::Borrowed(kind),
            plural: Cow::Borrowed(plural),
            namespaced,
        }
    }

    pub const NAMESPACE: Self = Self::new("", "v1", "Namespace", "namespaces", false);
    pub const SECRET: Self = Self::new("", "v1", "Secret", "secrets", true);
    pub const CONFIG_MAP: Self = Self::new("", "v1", "ConfigMap", "configmaps", true);
    pub const CRD: Self = Self::new(
        "apiextensions.k8s.io",
        "v1",
        "CustomResourceDefinition",
        "customresourcedefinitions",
        false,
    );
    pub const KYMA: Self = Self::new("operator.kyma-project.io", "v1beta2", "Kyma", "kymas", true);
    pub const GARDENER_CLUSTER: Self = Self::new(
        "infrastructuremanager.kyma-project.io",
        "v1",
        "GardenerCluster",
        "gardenerclusters",
        true,
    );
    pub const RUNTIME: Self = Self::new(
        "infrastructuremanager.kyma-project.io",
        "v1",
        "Runtime",
        "runtimes",
        true,
    );
    pub const SERVICE_BINDING: Self = Self::new(
        "services.cloud.sap.com",
        "v1",
        "ServiceBinding",
        "servicebindings",
        true,
    );
    pub const SERVICE_INSTANCE: Self = Self::new(
        "services.cloud.sap.com",
        "v1",
        "ServiceInstance",
        "serviceinstances",
        true,
    );
    pub const SHOOT: Self = Self::new("core.gardener.cloud", "v1beta1", "Shoot", "shoots", true);
    pub const SECRET_BINDING: Self = Self::new(
        "core.gardener.cloud",
        "v1beta1",
        "SecretBinding",
        "secretbindings",
        true,
    );

    /// A namespaced kind known only at runtime, e.g. from a template.
    pub fn custom(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self {
            group: Cow::Owned(group),
            version: Cow::Owned(version),
            plural: Cow::Owned(plural_of(kind)),
            kind: Cow::Owned(kind.to_string()),
            namespaced: true,
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Name of the CRD that defines this kind.
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }

    /// An empty object of this kind.
    pub fn object(&self, namespace: Option<&str>, name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &self.api_resource());
        if self.namespaced {
            obj.metadata.namespace = namespace.map(str::to_string);
        }
        obj
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version())
    }
}

fn plural_of(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'o', 'u'])
    {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

/// Failure of a cluster call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    /// The kind is not served by the cluster (CRD missing).
    #[error("no match for kind {kind}")]
    NoMatch { kind: String },

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    #[error("object conversion failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::NotFound { .. } | ClusterError::NoMatch { .. } => ErrorKind::NotFound,
            ClusterError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ClusterError::Conflict { .. } => ErrorKind::Conflict,
            ClusterError::Api { code, .. } if *code >= 500 || *code == 429 => ErrorKind::Transient,
            ClusterError::Api { .. } => ErrorKind::Permanent,
            ClusterError::Transport(_) | ClusterError::Timeout(_) => ErrorKind::Transient,
            ClusterError::Serialization(_) => ErrorKind::Permanent,
        }
    }

    /// The object does not exist. A missing CRD is not included.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, ClusterError::NoMatch { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Minimal verb set over dynamic objects.
///
/// `namespace` is ignored for cluster-scoped kinds. `create` and `replace`
/// take the namespace from the object's metadata.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;

    /// List objects, across all namespaces when `namespace` is `None`.
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    async fn create(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn replace(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn delete(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;

    /// Delete every object of a kind in one namespace.
    async fn delete_collection(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<(), ClusterError>;
}

/// Convert a typed resource into a dynamic object.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object into a typed resource.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Label value of an object, if present.
pub fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// Annotation value of an object, if present.
pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Whether a label selector of the form `k=v,k!=v,k,!k` matches `obj`.
pub fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                label(obj, key.trim()) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once('=') {
                let value = value.trim_start_matches('=');
                label(obj, key.trim()) == Some(value.trim())
            } else if let Some(key) = term.strip_prefix('!') {
                label(obj, key.trim()).is_none()
            } else {
                label(obj, term).is_some()
            }
        })
}
