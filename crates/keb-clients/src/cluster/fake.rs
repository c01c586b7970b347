// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster for tests and local runs.
//!
//! Mimics the API-server behaviour the steps rely on: kinds are only served
//! once their CRD exists, objects with finalizers linger with a deletion
//! timestamp until the finalizers are removed, and `replace` enforces
//! `resourceVersion`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use tokio::sync::Mutex;

use super::{
    ClusterAccessError, ClusterAccessProvider, ClusterClient, ClusterError, ResourceKind,
    matches_selector,
};

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    failing: HashMap<(String, String), u16>,
    unreachable: bool,
    revision: u64,
    deletes: Vec<String>,
}

impl State {
    fn check(&self, kind: &ResourceKind) -> Result<(), ClusterError> {
        if self.unreachable {
            return Err(ClusterError::Transport("connection refused".to_string()));
        }
        if let Some(code) = self.failing.get(&type_key(kind)) {
            return Err(ClusterError::Api {
                code: *code,
                message: format!("injected failure for {kind}"),
            });
        }
        if !self.is_served(kind) {
            return Err(ClusterError::NoMatch {
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    fn is_served(&self, kind: &ResourceKind) -> bool {
        kind.group.is_empty()
            || *kind == ResourceKind::CRD
            || self
                .objects
                .contains_key(&key(&ResourceKind::CRD, None, &kind.crd_name()))
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    /// Deletes honour finalizers: the object stays, marked for deletion.
    fn delete(&mut self, k: ObjectKey) {
        let finalized = match self.objects.get(&k) {
            Some(obj) => obj
                .metadata
                .finalizers
                .as_ref()
                .is_some_and(|f| !f.is_empty()),
            None => return,
        };
        self.deletes.push(format!("{}/{}/{}", k.1, k.2, k.3));
        if finalized {
            let revision = self.next_revision();
            if let Some(obj) = self.objects.get_mut(&k) {
                obj.metadata
                    .deletion_timestamp
                    .get_or_insert_with(|| Time(Utc::now()));
                obj.metadata.resource_version = Some(revision);
            }
        } else {
            self.objects.remove(&k);
        }
    }
}

fn type_key(kind: &ResourceKind) -> (String, String) {
    (kind.api_version(), kind.kind.to_string())
}

fn key(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    let namespace = if kind.namespaced {
        namespace.unwrap_or_default()
    } else {
        ""
    };
    (
        kind.api_version(),
        kind.kind.to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn object_key(kind: &ResourceKind, obj: &DynamicObject) -> ObjectKey {
    key(
        kind,
        obj.metadata.namespace.as_deref(),
        obj.metadata.name.as_deref().unwrap_or_default(),
    )
}

fn not_found(kind: &ResourceKind, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.kind.to_string(),
        name: name.to_string(),
    }
}

/// Shared handle to an in-memory cluster; clones see the same objects.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a custom kind by creating its CRD.
    pub async fn install(&self, kind: &ResourceKind) {
        let crd = ResourceKind::CRD.object(None, &kind.crd_name());
        let mut state = self.state.lock().await;
        let k = object_key(&ResourceKind::CRD, &crd);
        state.objects.entry(k).or_insert(crd);
    }

    pub async fn uninstall(&self, kind: &ResourceKind) {
        let mut state = self.state.lock().await;
        state
            .objects
            .remove(&key(&ResourceKind::CRD, None, &kind.crd_name()));
    }

    /// Make every call fail with a transport error.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Make every call on `kind` fail with the given HTTP status, or stop
    /// failing with `None`.
    pub async fn fail_kind(&self, kind: &ResourceKind, code: Option<u16>) {
        let mut state = self.state.lock().await;
        match code {
            Some(code) => state.failing.insert(type_key(kind), code),
            None => state.failing.remove(&type_key(kind)),
        };
    }

    /// Store an object as-is, bypassing CRD checks.
    pub async fn insert(&self, kind: &ResourceKind, mut obj: DynamicObject) {
        obj.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.to_string(),
        });
        let mut state = self.state.lock().await;
        obj.metadata.resource_version = Some(state.next_revision());
        let k = object_key(kind, &obj);
        state.objects.insert(k, obj);
    }

    /// Object lookup without any failure injection.
    pub async fn object(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let state = self.state.lock().await;
        state.objects.get(&key(kind, namespace, name)).cloned()
    }

    pub async fn count(&self, kind: &ResourceKind) -> usize {
        let (api_version, kind_name) = type_key(kind);
        let state = self.state.lock().await;
        state
            .objects
            .keys()
            .filter(|(a, k, _, _)| *a == api_version && *k == kind_name)
            .count()
    }

    /// `Kind/namespace/name` of every delete request that hit an object.
    pub async fn deletes(&self) -> Vec<String> {
        self.state.lock().await.deletes.clone()
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let state = self.state.lock().await;
        state.check(kind)?;
        state
            .objects
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(kind, name))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let state = self.state.lock().await;
        state.check(kind)?;
        let (api_version, kind_name) = type_key(kind);
        Ok(state
            .objects
            .iter()
            .filter(|((a, k, ns, _), _)| {
                *a == api_version
                    && *k == kind_name
                    && namespace.is_none_or(|wanted| !kind.namespaced || ns == wanted)
            })
            .map(|(_, obj)| obj)
            .filter(|obj| label_selector.is_none_or(|s| matches_selector(obj, s)))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let k = object_key(kind, obj);
        if state.objects.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: kind.kind.to_string(),
                name: k.3,
            });
        }
        let mut stored = obj.clone();
        stored.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.to_string(),
        });
        stored.metadata.resource_version = Some(state.next_revision());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.deletion_timestamp = None;
        state.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        kind: &ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let k = object_key(kind, obj);
        let Some(current) = state.objects.get(&k) else {
            return Err(not_found(kind, &k.3));
        };
        if obj
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|v| Some(v) != current.metadata.resource_version.as_ref())
        {
            return Err(ClusterError::Conflict {
                kind: kind.kind.to_string(),
                name: k.3,
            });
        }

        let deletion_timestamp = current.metadata.deletion_timestamp.clone();
        let creation_timestamp = current.metadata.creation_timestamp.clone();
        let finalized = obj
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if deletion_timestamp.is_some() && !finalized {
            state.objects.remove(&k);
            return Ok(obj.clone());
        }

        let mut stored = obj.clone();
        stored.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.to_string(),
        });
        stored.metadata.resource_version = Some(state.next_revision());
        stored.metadata.deletion_timestamp = deletion_timestamp;
        stored.metadata.creation_timestamp = creation_timestamp;
        state.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let k = key(kind, namespace, name);
        if !state.objects.contains_key(&k) {
            return Err(not_found(kind, name));
        }
        state.delete(k);
        Ok(())
    }

    async fn delete_collection(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(kind)?;
        let (api_version, kind_name) = type_key(kind);
        let keys: Vec<ObjectKey> = state
            .objects
            .keys()
            .filter(|(a, k, ns, _)| *a == api_version && *k == kind_name && ns == namespace)
            .cloned()
            .collect();
        for k in keys {
            state.delete(k);
        }
        Ok(())
    }
}

/// Access provider over registered in-memory clusters.
#[derive(Clone, Default)]
pub struct FakeClusterAccessProvider {
    clusters: Arc<Mutex<HashMap<String, Arc<FakeCluster>>>>,
}

impl FakeClusterAccessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant cluster, returning the existing one if present.
    pub async fn register(&self, runtime_id: &str) -> Arc<FakeCluster> {
        self.clusters
            .lock()
            .await
            .entry(runtime_id.to_string())
            .or_insert_with(|| Arc::new(FakeCluster::new()))
            .clone()
    }

    /// Forget a cluster, as if its kubeconfig was removed.
    pub async fn remove(&self, runtime_id: &str) {
        self.clusters.lock().await.remove(runtime_id);
    }
}

#[async_trait::async_trait]
impl ClusterAccessProvider for FakeClusterAccessProvider {
    async fn client_for(
        &self,
        runtime_id: &str,
    ) -> Result<Arc<dyn ClusterClient>, ClusterAccessError> {
        let clusters = self.clusters.lock().await;
        match clusters.get(runtime_id) {
            Some(cluster) => Ok(cluster.clone() as Arc<dyn ClusterClient>),
            None => Err(ClusterAccessError::KubeconfigNotFound {
                runtime_id: runtime_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_custom_kind_requires_crd() {
        let cluster = FakeCluster::new();
        let err = cluster
            .get(&ResourceKind::KYMA, Some("kcp-system"), "rt-1")
            .await
            .unwrap_err();
        assert!(err.is_no_match());

        cluster.install(&ResourceKind::KYMA).await;
        let err = cluster
            .get(&ResourceKind::KYMA, Some("kcp-system"), "rt-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_finalizers_defer_deletion() {
        let cluster = FakeCluster::new();
        cluster.install(&ResourceKind::SERVICE_INSTANCE).await;
        let mut obj = ResourceKind::SERVICE_INSTANCE.object(Some("default"), "si-1");
        obj.metadata.finalizers = Some(vec!["services.cloud.sap.com/finalizer".to_string()]);
        cluster
            .create(&ResourceKind::SERVICE_INSTANCE, &obj)
            .await
            .unwrap();

        cluster
            .delete(&ResourceKind::SERVICE_INSTANCE, Some("default"), "si-1")
            .await
            .unwrap();
        let mut pending = cluster
            .get(&ResourceKind::SERVICE_INSTANCE, Some("default"), "si-1")
            .await
            .unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        pending.metadata.finalizers = None;
        cluster
            .replace(&ResourceKind::SERVICE_INSTANCE, &pending)
            .await
            .unwrap();
        assert_eq!(cluster.count(&ResourceKind::SERVICE_INSTANCE).await, 0);
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let cluster = FakeCluster::new();
        let created = cluster
            .create(
                &ResourceKind::SECRET,
                &ResourceKind::SECRET.object(Some("ns"), "s"),
            )
            .await
            .unwrap();
        cluster
            .replace(&ResourceKind::SECRET, &created)
            .await
            .unwrap();

        let err = cluster
            .replace(&ResourceKind::SECRET, &created)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let cluster = FakeCluster::new();
        for (ns, name, dirty) in [("a", "s1", "true"), ("a", "s2", "false"), ("b", "s3", "true")] {
            let mut obj = ResourceKind::SECRET.object(Some(ns), name);
            obj.metadata.labels = Some(BTreeMap::from([("dirty".to_string(), dirty.to_string())]));
            cluster.create(&ResourceKind::SECRET, &obj).await.unwrap();
        }

        let all = cluster
            .list(&ResourceKind::SECRET, None, Some("dirty=true"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let in_a = cluster
            .list(&ResourceKind::SECRET, Some("a"), None)
            .await
            .unwrap();
        assert_eq!(in_a.len(), 2);
    }

    #[tokio::test]
    async fn test_access_provider_without_cluster() {
        let provider = FakeClusterAccessProvider::new();
        let cluster = provider.register("rt-1").await;
        cluster.set_unreachable(true).await;

        let client = provider.client_for("rt-1").await.unwrap();
        assert!(client.list(&ResourceKind::SECRET, None, None).await.is_err());
        assert!(
            provider
                .client_for("rt-2")
                .await
                .err()
                .unwrap()
                .is_kubeconfig_not_found()
        );
    }
}
