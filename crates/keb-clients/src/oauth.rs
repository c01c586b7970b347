// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OAuth2 client-credentials token source.
//!
//! Tokens are cached and refreshed shortly before they expire. A token
//! response without `expires_in` is cached for [`DEFAULT_TOKEN_LIFETIME`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Lifetime assumed when the token endpoint does not report one.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Client-credentials grant parameters.
#[derive(Debug, Clone, Default)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

/// Caching token source for one set of client credentials.
pub struct TokenSource {
    http: reqwest::Client,
    credentials: ClientCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, fetching a new one when the cached one is stale.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.refresh_at > Utc::now()
        {
            return Ok(token.value.clone());
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the resource server answered 401.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let url = &self.credentials.token_url;
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = self.credentials.scope.as_deref()
            && !scope.is_empty()
        {
            form.push(("scope", scope));
        }

        let response = self
            .http
            .post(url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| ClientError::Token {
                url: url.clone(),
                message: e.to_string(),
                temporary: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Token {
                url: url.clone(),
                message: format!("status {}: {}", status.as_u16(), body),
                temporary: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| ClientError::Token {
            url: url.clone(),
            message: format!("invalid token response: {e}"),
            temporary: false,
        })?;

        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
            .saturating_sub(EXPIRY_MARGIN);
        let refresh_at = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::zero());

        debug!(token_url = %url, lifetime_secs = lifetime.as_secs(), "Fetched access token");

        Ok(CachedToken {
            value: token.access_token,
            refresh_at,
        })
    }
}
