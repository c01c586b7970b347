// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the broker's own service-instance API.
//!
//! Jobs outside the broker (environments cleanup) trigger an ordinary
//! deprovisioning through this API instead of touching storage directly.

use std::sync::Arc;
use std::time::Duration;

use keb_core::plans::KYMA_SERVICE_ID;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ClientError, Result};
use crate::oauth::{ClientCredentials, TokenSource};

const SERVICE: &str = "broker";
const INSTANCES_PATH: &str = "/oauth/v2/service_instances";

/// Broker API settings. An empty `token_url` disables authentication.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    #[serde(default)]
    operation: String,
}

#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Request deprovisioning of an instance; returns the broker operation id.
    async fn deprovision(&self, instance_id: &str, plan_id: &str) -> Result<String>;
}

/// HTTP implementation against the broker's OSB endpoint.
pub struct HttpBrokerClient {
    http: reqwest::Client,
    tokens: Option<TokenSource>,
    url: String,
}

impl HttpBrokerClient {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::transport(SERVICE, e))?;
        let tokens = (!config.token_url.is_empty()).then(|| {
            TokenSource::new(
                http.clone(),
                ClientCredentials {
                    token_url: config.token_url.clone(),
                    client_id: config.client_id.clone(),
                    client_secret: config.client_secret.clone(),
                    scope: Some(config.scope.clone()),
                },
            )
        });
        Ok(Self {
            http,
            tokens,
            url: config.url,
        })
    }
}

#[async_trait::async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn deprovision(&self, instance_id: &str, plan_id: &str) -> Result<String> {
        let url = format!("{}{}/{}", self.url, INSTANCES_PATH, instance_id);
        let mut request = self
            .http
            .delete(&url)
            .query(&[("service_id", KYMA_SERVICE_ID), ("plan_id", plan_id)])
            .header("X-Broker-API-Version", "2.14");
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.token().await?);
        }

        info!(instance_id, "Requesting deprovisioning");
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::transport(SERVICE, e))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                service: SERVICE,
                status: status.as_u16(),
                message,
            });
        }

        let body: OperationResponse = response
            .json()
            .await
            .map_err(|e| ClientError::invalid(SERVICE, e.to_string()))?;
        Ok(body.operation)
    }
}

/// Records deprovisioning requests instead of sending them.
#[derive(Clone, Default)]
pub struct FakeBrokerClient {
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(instance_id, plan_id)` pairs in call order.
    pub async fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn deprovision(&self, instance_id: &str, plan_id: &str) -> Result<String> {
        self.requests
            .lock()
            .await
            .push((instance_id.to_string(), plan_id.to_string()));
        Ok(format!("deprovision-{instance_id}"))
    }
}
