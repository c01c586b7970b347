// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The BTP manager secret inside a tenant cluster.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keb_clients::cluster::{ClusterClient, ResourceKind, to_dynamic};
use keb_core::model::ServiceManagerOperatorCredentials;
use tracing::{info, warn};

use super::CredentialsError;

pub const BTP_MANAGER_SECRET_NAME: &str = "sap-btp-manager";
pub const BTP_MANAGER_SECRET_NAMESPACE: &str = "kyma-system";

/// Set to `true` by users who manage the secret themselves.
pub const SKIP_RECONCILIATION_LABEL: &str = "operator.kyma-project.io/skip-reconciliation";

const BROKER: &str = "kcp-kyma-environment-broker";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const WATCHED_BY_LABEL: &str = "app.kubernetes.io/watched-by";
const WARNING_ANNOTATION: &str = "Warning";
const WARNING_MESSAGE: &str = "This secret is generated. Do not edit!";

pub const CLIENT_ID_KEY: &str = "clientid";
pub const CLIENT_SECRET_KEY: &str = "clientsecret";
pub const SM_URL_KEY: &str = "sm_url";
pub const TOKEN_URL_KEY: &str = "tokenurl";
pub const CLUSTER_ID_KEY: &str = "cluster_id";

/// Data keys compared between the cluster and the database.
pub const SECRET_KEYS: [&str; 5] = [
    CLIENT_SECRET_KEY,
    CLIENT_ID_KEY,
    SM_URL_KEY,
    TOKEN_URL_KEY,
    CLUSTER_ID_KEY,
];

pub fn broker_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), BROKER.to_string()),
        (WATCHED_BY_LABEL.to_string(), BROKER.to_string()),
    ])
}

fn broker_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(WARNING_ANNOTATION.to_string(), WARNING_MESSAGE.to_string())])
}

/// Build the secret the cluster should hold.
pub fn prepare_secret(
    credentials: Option<&ServiceManagerOperatorCredentials>,
    cluster_id: &str,
) -> Result<Secret, CredentialsError> {
    let Some(credentials) = credentials else {
        return Err(CredentialsError::MissingData("credentials"));
    };
    let fields = [
        (CLIENT_ID_KEY, credentials.client_id.as_str(), "client id"),
        (CLIENT_SECRET_KEY, credentials.client_secret.as_str(), "client secret"),
        (SM_URL_KEY, credentials.sm_url.as_str(), "service manager url"),
        (TOKEN_URL_KEY, credentials.url.as_str(), "token url"),
        (CLUSTER_ID_KEY, cluster_id, "cluster id"),
    ];
    if let Some((_, _, what)) = fields.iter().find(|(_, value, _)| value.is_empty()) {
        return Err(CredentialsError::MissingData(*what));
    }

    let data = fields
        .iter()
        .map(|(key, value, _)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
        .collect();
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(BTP_MANAGER_SECRET_NAME.to_string()),
            namespace: Some(BTP_MANAGER_SECRET_NAMESPACE.to_string()),
            labels: Some(broker_labels()),
            annotations: Some(broker_annotations()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Whether the user has taken over the secret.
pub fn is_skipped(secret: &Secret) -> bool {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SKIP_RECONCILIATION_LABEL))
        .is_some_and(|value| value == "true")
}

/// Keys whose values differ. A key missing on either side differs.
pub fn diff_keys(current: &Secret, desired: &Secret) -> Vec<&'static str> {
    let value = |secret: &Secret, key: &str| -> Option<Vec<u8>> {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| bytes.0.clone())
    };
    SECRET_KEYS
        .into_iter()
        .filter(|key| {
            let actual = value(current, *key);
            actual.is_none() || actual != value(desired, *key)
        })
        .collect()
}

/// Create the secret, and its namespace if needed.
pub async fn create_secret(
    client: &dyn ClusterClient,
    desired: &Secret,
) -> Result<(), CredentialsError> {
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(BTP_MANAGER_SECRET_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match client
        .create(&ResourceKind::NAMESPACE, &to_dynamic(&namespace)?)
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    client
        .create(&ResourceKind::SECRET, &to_dynamic(desired)?)
        .await?;
    info!("The secret for BTP Manager created");
    Ok(())
}

/// Overwrite data, labels and annotations of an existing secret.
pub async fn update_secret(
    client: &dyn ClusterClient,
    mut current: Secret,
    desired: &Secret,
) -> Result<(), CredentialsError> {
    if current.metadata.labels.as_ref() != Some(&broker_labels()) {
        warn!(
            secret = BTP_MANAGER_SECRET_NAME,
            "The secret was not created by the broker and its data will be overwritten"
        );
    }
    current.data = desired.data.clone();
    current.metadata.labels = desired.metadata.labels.clone();
    current.metadata.annotations = desired.metadata.annotations.clone();

    client
        .replace(&ResourceKind::SECRET, &to_dynamic(&current)?)
        .await?;
    info!("The secret for BTP Manager updated");
    Ok(())
}
