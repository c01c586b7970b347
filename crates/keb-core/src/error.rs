// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keb-core.
//!
//! Storage failures are reported through [`StorageError`]. Every error in the
//! back-plane, storage or otherwise, can be classified into an [`ErrorKind`];
//! callers branch on the kind rather than on concrete variants.

use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;

/// Result type using StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Coarse error classification used for retry and skip decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced row, object or CRD does not exist.
    NotFound,
    /// A uniqueness constraint was violated.
    AlreadyExists,
    /// An optimistic-lock version mismatch.
    Conflict,
    /// Network, timeout, 5xx or another retryable dependency failure.
    Transient,
    /// Invalid input, unknown state or another non-retryable failure.
    Permanent,
    /// An invariant was broken; the current batch must stop.
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        }
    }

    /// Whether an operation failing with this kind may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested row does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity family (instance, operation, ...).
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// A row with the same key already exists.
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Entity family.
        entity: &'static str,
        /// Duplicated key.
        id: String,
    },

    /// The stored version differs from the one supplied with the update.
    #[error("{entity} '{id}' was modified concurrently (expected version {expected})")]
    Conflict {
        /// Entity family.
        entity: &'static str,
        /// Key of the updated row.
        id: String,
        /// Version the caller based its update on.
        expected: i32,
    },

    /// Database driver failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A credential column could not be encrypted or decrypted.
    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),

    /// A stored value could not be interpreted.
    #[error("Invalid stored value for {field}: {value}")]
    InvalidValue {
        /// Column name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, id: impl Into<String>, expected: i32) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
            expected,
        }
    }

    /// Maps an insert failure, turning unique violations into `AlreadyExists`.
    pub(crate) fn from_insert(err: sqlx::Error, entity: &'static str, id: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::already_exists(entity, id)
            }
            _ => Self::Database(err),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Database(_) | Self::Migration(_) => ErrorKind::Transient,
            Self::Json(_) | Self::Encryption(_) | Self::InvalidValue { .. } => {
                ErrorKind::Permanent
            }
        }
    }

    /// Whether the error is a `NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether the error is an `AlreadyExists`.
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Whether the error is a `Conflict`.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_kinds() {
        let cases = vec![
            (StorageError::not_found("instance", "i-1"), ErrorKind::NotFound),
            (
                StorageError::already_exists("instance_archived", "i-1"),
                ErrorKind::AlreadyExists,
            ),
            (StorageError::conflict("operation", "op-1", 3), ErrorKind::Conflict),
            (
                StorageError::Database(sqlx::Error::PoolTimedOut),
                ErrorKind::Transient,
            ),
            (
                StorageError::InvalidValue {
                    field: "state",
                    value: "bogus".to_string(),
                },
                ErrorKind::Permanent,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_storage_error_display() {
        assert_eq!(
            StorageError::not_found("instance", "abc").to_string(),
            "instance 'abc' not found"
        );
        assert_eq!(
            StorageError::conflict("operation", "op-1", 7).to_string(),
            "operation 'op-1' was modified concurrently (expected version 7)"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
        assert_eq!(ErrorKind::AlreadyExists.to_string(), "already_exists");
    }
}
