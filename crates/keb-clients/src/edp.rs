// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event-Data-Platform (EDP) admin API.
//!
//! | Status | Outcome |
//! |--------|---------|
//! | 201, 204 | success |
//! | 404 | success on delete, `NotFound` otherwise |
//! | 409 | `Conflict` |
//! | 408, 5xx | temporary `Status` |
//! | 400 | `BadRequest` |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ClientError, Result};
use crate::oauth::{ClientCredentials, TokenSource};

const SERVICE: &str = "edp";

pub const MAAS_CONSUMER_ENVIRONMENT_KEY: &str = "maasConsumerEnvironment";
pub const MAAS_CONSUMER_REGION_KEY: &str = "maasConsumerRegion";
pub const MAAS_CONSUMER_SUB_ACCOUNT_KEY: &str = "maasConsumerSubAccount";
pub const MAAS_CONSUMER_SERVICE_PLAN: &str = "maasConsumerServicePlan";

/// Metadata keys written at registration and removed at deregistration.
pub const METADATA_KEYS: [&str; 4] = [
    MAAS_CONSUMER_ENVIRONMENT_KEY,
    MAAS_CONSUMER_REGION_KEY,
    MAAS_CONSUMER_SUB_ACCOUNT_KEY,
    MAAS_CONSUMER_SERVICE_PLAN,
];

/// EDP connection settings.
#[derive(Debug, Clone)]
pub struct EdpConfig {
    pub auth_url: String,
    pub admin_url: String,
    pub namespace: String,
    pub secret: String,
    pub environment: String,
    pub disabled: bool,
}

impl Default for EdpConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            admin_url: String::new(),
            namespace: String::new(),
            secret: String::new(),
            environment: "prod".to_string(),
            disabled: false,
        }
    }
}

/// Payload for creating a data tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTenantPayload {
    pub name: String,
    pub environment: String,
    #[serde(rename = "secretKey", default)]
    pub secret_key: String,
}

/// One metadata entry of a data tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "dataTenant", default)]
    pub data_tenant: Option<serde_json::Value>,
    pub key: String,
    pub value: String,
}

#[async_trait::async_trait]
pub trait EdpClient: Send + Sync {
    async fn create_data_tenant(&self, payload: &DataTenantPayload) -> Result<()>;

    /// Delete a data tenant; a missing tenant is not an error.
    async fn delete_data_tenant(&self, name: &str, env: &str) -> Result<()>;

    async fn create_metadata_tenant(&self, name: &str, env: &str, key: &str, value: &str)
    -> Result<()>;

    /// Delete a metadata key; a missing key is not an error.
    async fn delete_metadata_tenant(&self, name: &str, env: &str, key: &str) -> Result<()>;

    /// Metadata of a data tenant; empty when the tenant does not exist.
    async fn get_metadata_tenant(&self, name: &str, env: &str) -> Result<Vec<MetadataItem>>;
}

/// HTTP client for the EDP admin API, authenticated per namespace.
pub struct HttpEdpClient {
    http: reqwest::Client,
    tokens: TokenSource,
    config: EdpConfig,
}

impl HttpEdpClient {
    pub fn new(config: EdpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::transport(SERVICE, e))?;
        let tokens = TokenSource::new(
            http.clone(),
            ClientCredentials {
                token_url: format!("{}/oauth2/token", config.auth_url),
                client_id: format!("edp-namespace;{}", config.namespace),
                client_secret: config.secret.clone(),
                scope: Some("edp-namespace.read edp-namespace.update".to_string()),
            },
        );
        Ok(Self {
            http,
            tokens,
            config,
        })
    }

    fn data_tenant_url(&self) -> String {
        format!(
            "{}/namespaces/{}/dataTenants",
            self.config.admin_url, self.config.namespace
        )
    }

    fn metadata_tenant_url(&self, name: &str, env: &str) -> String {
        format!("{}/{}/{}/metadata", self.data_tenant_url(), name, env)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| ClientError::transport(SERVICE, e))
    }

    async fn process_response(
        &self,
        response: reqwest::Response,
        allow_not_found: bool,
        id: &str,
    ) -> Result<()> {
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::CREATED => {
                info!(url = %url, "EDP resource created");
                Ok(())
            }
            StatusCode::NO_CONTENT => {
                info!(url = %url, "EDP action executed");
                Ok(())
            }
            StatusCode::CONFLICT => {
                warn!(url = %url, "EDP resource already exists");
                Err(ClientError::Conflict {
                    service: SERVICE,
                    id: id.to_string(),
                })
            }
            StatusCode::NOT_FOUND if allow_not_found => {
                warn!(url = %url, "EDP resource not found");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound {
                service: SERVICE,
                id: id.to_string(),
            }),
            StatusCode::BAD_REQUEST => {
                warn!(url = %url, body = %body, "EDP rejected request");
                Err(ClientError::BadRequest {
                    service: SERVICE,
                    message: body,
                })
            }
            other => {
                warn!(url = %url, status = other.as_u16(), body = %body, "EDP returned failed status");
                Err(ClientError::Status {
                    service: SERVICE,
                    status: other.as_u16(),
                    message: body,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl EdpClient for HttpEdpClient {
    async fn create_data_tenant(&self, payload: &DataTenantPayload) -> Result<()> {
        let body = serde_json::to_value(payload)
            .map_err(|e| ClientError::invalid(SERVICE, e.to_string()))?;
        let response = self
            .send(Method::POST, &self.data_tenant_url(), Some(body))
            .await?;
        self.process_response(response, false, &payload.name).await
    }

    async fn delete_data_tenant(&self, name: &str, env: &str) -> Result<()> {
        let url = format!("{}/{}/{}", self.data_tenant_url(), name, env);
        let response = self.send(Method::DELETE, &url, None).await?;
        self.process_response(response, true, name).await
    }

    async fn create_metadata_tenant(
        &self,
        name: &str,
        env: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let body = serde_json::json!({ "key": key, "value": value });
        let response = self
            .send(Method::POST, &self.metadata_tenant_url(name, env), Some(body))
            .await?;
        self.process_response(response, false, name).await
    }

    async fn delete_metadata_tenant(&self, name: &str, env: &str, key: &str) -> Result<()> {
        let url = format!("{}/{}", self.metadata_tenant_url(name, env), key);
        let response = self.send(Method::DELETE, &url, None).await?;
        self.process_response(response, true, name).await
    }

    async fn get_metadata_tenant(&self, name: &str, env: &str) -> Result<Vec<MetadataItem>> {
        let response = self
            .send(Method::GET, &self.metadata_tenant_url(name, env), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| ClientError::invalid(SERVICE, e.to_string())),
            s => Err(ClientError::Status {
                service: SERVICE,
                status: s.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

// ============================================================================
// Fake
// ============================================================================

#[derive(Default)]
struct FakeEdpState {
    tenants: HashMap<(String, String), BTreeMap<String, String>>,
    failures: usize,
}

/// In-memory EDP keyed by `(tenant name, environment)`.
#[derive(Clone, Default)]
pub struct FakeEdpClient {
    state: Arc<Mutex<FakeEdpState>>,
}

impl FakeEdpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a temporary error.
    pub async fn fail_temporarily(&self, count: usize) {
        self.state.lock().await.failures = count;
    }

    pub async fn has_tenant(&self, name: &str, env: &str) -> bool {
        self.state
            .lock()
            .await
            .tenants
            .contains_key(&(name.to_string(), env.to_string()))
    }

    async fn check_failure(&self) -> Result<tokio::sync::MutexGuard<'_, FakeEdpState>> {
        let mut state = self.state.lock().await;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ClientError::Status {
                service: SERVICE,
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl EdpClient for FakeEdpClient {
    async fn create_data_tenant(&self, payload: &DataTenantPayload) -> Result<()> {
        let mut state = self.check_failure().await?;
        let key = (payload.name.clone(), payload.environment.clone());
        if state.tenants.contains_key(&key) {
            return Err(ClientError::Conflict {
                service: SERVICE,
                id: payload.name.clone(),
            });
        }
        state.tenants.insert(key, BTreeMap::new());
        Ok(())
    }

    async fn delete_data_tenant(&self, name: &str, env: &str) -> Result<()> {
        let mut state = self.check_failure().await?;
        state.tenants.remove(&(name.to_string(), env.to_string()));
        Ok(())
    }

    async fn create_metadata_tenant(
        &self,
        name: &str,
        env: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.check_failure().await?;
        let metadata = state
            .tenants
            .get_mut(&(name.to_string(), env.to_string()))
            .ok_or_else(|| ClientError::NotFound {
                service: SERVICE,
                id: name.to_string(),
            })?;
        metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_metadata_tenant(&self, name: &str, env: &str, key: &str) -> Result<()> {
        let mut state = self.check_failure().await?;
        if let Some(metadata) = state.tenants.get_mut(&(name.to_string(), env.to_string())) {
            metadata.remove(key);
        }
        Ok(())
    }

    async fn get_metadata_tenant(&self, name: &str, env: &str) -> Result<Vec<MetadataItem>> {
        let state = self.check_failure().await?;
        Ok(state
            .tenants
            .get(&(name.to_string(), env.to_string()))
            .map(|metadata| {
                metadata
                    .iter()
                    .map(|(key, value)| MetadataItem {
                        data_tenant: None,
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
