// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Legacy runtime provisioner, spoken to over GraphQL.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClientError, Result};

const SERVICE: &str = "provisioner";

/// State of a provisioner operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerOperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Unknown(String),
}

impl From<String> for ProvisionerOperationState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" | "PENDING" => Self::Pending,
            "InProgress" | "IN_PROGRESS" => Self::InProgress,
            "Succeeded" | "SUCCEEDED" => Self::Succeeded,
            "Failed" | "FAILED" => Self::Failed,
            _ => Self::Unknown(value),
        }
    }
}

impl<'de> Deserialize<'de> for ProvisionerOperationState {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(d).map(Self::from)
    }
}

/// Error details the provisioner attaches to a failed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerLastError {
    #[serde(default)]
    pub err_message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub component: String,
}

/// Status of a runtime operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerOperationStatus {
    #[serde(default)]
    pub id: Option<String>,
    pub state: ProvisionerOperationState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "runtimeID")]
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<ProvisionerLastError>,
}

/// Operations the deprovisioning pipeline needs from the provisioner.
#[async_trait::async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Start runtime deprovisioning; returns the provisioner operation id.
    async fn deprovision_runtime(&self, global_account_id: &str, runtime_id: &str)
    -> Result<String>;

    /// Current status of a provisioner operation.
    async fn runtime_operation_status(
        &self,
        global_account_id: &str,
        operation_id: &str,
    ) -> Result<ProvisionerOperationStatus>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<GraphQlData<T>>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlData<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: HashMap<String, serde_json::Value>,
}

impl GraphQlError {
    fn is_temporary(&self) -> bool {
        self.extensions
            .get("temporary")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// GraphQL client for the provisioner API.
pub struct HttpProvisionerClient {
    http: reqwest::Client,
    url: String,
}

impl HttpProvisionerClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::transport(SERVICE, e))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn execute<T>(&self, tenant: &str, query: String) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(&self.url)
            .header("Tenant", tenant)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| ClientError::transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                service: SERVICE,
                status: status.as_u16(),
                message,
            });
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| ClientError::invalid(SERVICE, e.to_string()))?;

        if let Some(first) = body.errors.first() {
            let temporary = body.errors.iter().all(GraphQlError::is_temporary);
            let message = body
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            debug!(tenant, error = %first.message, temporary, "Provisioner returned errors");
            return Err(ClientError::Remote {
                service: SERVICE,
                message,
                temporary,
            });
        }

        body.data
            .and_then(|d| d.result)
            .ok_or_else(|| ClientError::invalid(SERVICE, "empty result"))
    }
}

#[async_trait::async_trait]
impl ProvisionerClient for HttpProvisionerClient {
    async fn deprovision_runtime(
        &self,
        global_account_id: &str,
        runtime_id: &str,
    ) -> Result<String> {
        let query = format!(r#"mutation {{ result: deprovisionRuntime(id: "{runtime_id}") }}"#);
        self.execute(global_account_id, query).await
    }

    async fn runtime_operation_status(
        &self,
        global_account_id: &str,
        operation_id: &str,
    ) -> Result<ProvisionerOperationStatus> {
        let query = format!(
            r#"query {{ result: runtimeOperationStatus(id: "{operation_id}") {{
                id operation state message runtimeID
                lastError {{ errMessage reason component }}
            }} }}"#
        );
        self.execute(global_account_id, query).await
    }
}

// ============================================================================
// Fake
// ============================================================================

#[derive(Default)]
struct FakeProvisionerState {
    operations: HashMap<String, ProvisionerOperationStatus>,
    deprovisioned: Vec<String>,
    failures: VecDeque<ClientError>,
}

/// In-memory provisioner. Deprovisioning starts an in-progress operation
/// that tests finish through [`FakeProvisionerClient::finish_operation`].
#[derive(Clone, Default)]
pub struct FakeProvisionerClient {
    state: Arc<Mutex<FakeProvisionerState>>,
}

impl FakeProvisionerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a temporary error.
    pub async fn fail_temporarily(&self, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.failures.push_back(ClientError::Remote {
                service: SERVICE,
                message: "provisioner unavailable".to_string(),
                temporary: true,
            });
        }
    }

    /// Register an operation with a given state.
    pub async fn set_operation(&self, operation_id: &str, state: ProvisionerOperationState) {
        self.state.lock().await.operations.insert(
            operation_id.to_string(),
            ProvisionerOperationStatus {
                id: Some(operation_id.to_string()),
                state,
                message: None,
                runtime_id: None,
                last_error: None,
            },
        );
    }

    /// Move an existing operation to a terminal state.
    pub async fn finish_operation(&self, operation_id: &str, state: ProvisionerOperationState) {
        if let Some(op) = self.state.lock().await.operations.get_mut(operation_id) {
            op.state = state;
        }
    }

    /// Runtime ids deprovisioning was requested for, in call order.
    pub async fn deprovisioned_runtimes(&self) -> Vec<String> {
        self.state.lock().await.deprovisioned.clone()
    }
}

#[async_trait::async_trait]
impl ProvisionerClient for FakeProvisionerClient {
    async fn deprovision_runtime(
        &self,
        _global_account_id: &str,
        runtime_id: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        state.deprovisioned.push(runtime_id.to_string());
        state.operations.insert(
            operation_id.clone(),
            ProvisionerOperationStatus {
                id: Some(operation_id.clone()),
                state: ProvisionerOperationState::InProgress,
                message: None,
                runtime_id: Some(runtime_id.to_string()),
                last_error: None,
            },
        );
        Ok(operation_id)
    }

    async fn runtime_operation_status(
        &self,
        _global_account_id: &str,
        operation_id: &str,
    ) -> Result<ProvisionerOperationStatus> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state
            .operations
            .get(operation_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                service: SERVICE,
                id: operation_id.to_string(),
            })
    }
}
