// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `kube`-backed [`ClusterClient`].

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::DynamicObject;
use kube::{Client, Config};

use super::{ClusterClient, ClusterError, ResourceKind};

/// Cluster client over a live API server. Every call is bounded by `timeout`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    timeout: Duration,
}

impl KubeClusterClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// In-cluster configuration, falling back to the local kubeconfig.
    pub async fn infer(timeout: Duration) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client, timeout))
    }

    /// Build a client from kubeconfig YAML.
    pub async fn from_kubeconfig_yaml(yaml: &str, timeout: Duration) -> Result<Self, ClusterError> {
        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| ClusterError::Api {
            code: 400,
            message: format!("invalid kubeconfig: {e}"),
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Api {
                code: 400,
                message: format!("unusable kubeconfig: {e}"),
            })?;
        let client = Client::try_from(config).map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client, timeout))
    }

    /// Build a client from a kubeconfig file.
    pub async fn from_kubeconfig_path(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let yaml = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| ClusterError::Transport(format!("reading kubeconfig: {e}")))?;
        Self::from_kubeconfig_yaml(&yaml, timeout).await
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    async fn call<T, F>(&self, kind: &ResourceKind, name: &str, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(ClusterError::Timeout(self.timeout)),
            Ok(result) => result.map_err(|e| map_kube_error(e, kind, name)),
        }
    }
}

fn map_kube_error(err: kube::Error, kind: &ResourceKind, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 if response.message.contains("could not find the requested resource") => {
                ClusterError::NoMatch {
                    kind: kind.to_string(),
                }
            }
            404 => ClusterError::NotFound {
                kind: kind.kind.to_string(),
                name: name.to_string(),
            },
            409 if response.reason == "AlreadyExists" => ClusterError::AlreadyExists {
                kind: kind.kind.to_string(),
                name: name.to_string(),
            },
            409 => ClusterError::Conflict {
                kind: kind.kind.to_string(),
                name: name.to_string(),
            },
            code => ClusterError::Api {
                code,
                message: response.message,
            },
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

fn object_name(obj: &DynamicObject) -> &str {
    obj.metadata.name.as_deref().unwrap_or_default()
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api(kind, namespace);
        self.call(kind, name, api.get(name)).await
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let api = self.api(kind, namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.call(kind, "", api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        self.call(kind, object_name(obj), api.create(&PostParams::default(), obj))
            .await
    }

    async fn replace(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(obj);
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        self.call(kind, name, api.replace(name, &PostParams::default(), obj))
            .await
    }

    async fn delete(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let api = self.api(kind, namespace);
        self.call(kind, name, api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    async fn delete_collection(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<(), ClusterError> {
        let api = self.api(kind, Some(namespace));
        self.call(
            kind,
            "",
            api.delete_collection(&DeleteParams::default(), &ListParams::default()),
        )
        .await
        .map(|_| ())
    }
}
