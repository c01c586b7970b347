// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error type shared by the HTTP collaborators.

use keb_core::ErrorKind;
use thiserror::Error;

/// Result alias for HTTP client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure of a call to an external HTTP service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The request never produced a response (connect, TLS, timeout).
    #[error("{service}: request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a status the caller does not accept.
    #[error("{service}: unexpected status {status}: {message}")]
    Status {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("{service}: {id} not found")]
    NotFound { service: &'static str, id: String },

    /// The addressed resource already exists.
    #[error("{service}: {id} already exists")]
    Conflict { service: &'static str, id: String },

    /// The service rejected the request as malformed.
    #[error("{service}: bad request: {message}")]
    BadRequest {
        service: &'static str,
        message: String,
    },

    /// An application-level error reported inside a successful response.
    #[error("{service}: {message}")]
    Remote {
        service: &'static str,
        message: String,
        temporary: bool,
    },

    /// The response body could not be understood.
    #[error("{service}: invalid response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },

    /// The OAuth2 token endpoint did not issue a token.
    #[error("token request to {url} failed: {message}")]
    Token {
        url: String,
        message: String,
        temporary: bool,
    },
}

impl ClientError {
    /// Classification used by retry policies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport { .. } => ErrorKind::Transient,
            ClientError::Status { status, .. } => status_kind(*status),
            ClientError::NotFound { .. } => ErrorKind::NotFound,
            ClientError::Conflict { .. } => ErrorKind::AlreadyExists,
            ClientError::BadRequest { .. } => ErrorKind::Permanent,
            ClientError::Remote { temporary, .. } | ClientError::Token { temporary, .. } => {
                if *temporary {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            ClientError::InvalidResponse { .. } => ErrorKind::Permanent,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_temporary(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn transport(service: &'static str, source: reqwest::Error) -> Self {
        ClientError::Transport { service, source }
    }

    pub(crate) fn invalid(service: &'static str, message: impl Into<String>) -> Self {
        ClientError::InvalidResponse {
            service,
            message: message.into(),
        }
    }
}

/// Request timeouts, throttling and server errors are worth retrying.
pub(crate) fn status_kind(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        408 | 429 => ErrorKind::Transient,
        s if s >= 500 => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}
