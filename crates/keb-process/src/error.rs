// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keb-process.

use keb_clients::ClientError;
use keb_clients::cluster::{ClusterAccessError, ClusterError};
use keb_clients::hyperscaler::AccountPoolError;
use keb_core::model::{ErrorComponent, Operation};
use keb_core::{ErrorKind, StorageError};
use thiserror::Error;

/// Process-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cluster call failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Tenant cluster could not be reached.
    #[error("Cluster access error: {0}")]
    ClusterAccess(#[from] ClusterAccessError),

    /// HTTP collaborator failed.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Account pool failed.
    #[error("Account pool error: {0}")]
    AccountPool(#[from] AccountPoolError),

    /// A deprovisioning step failed the operation.
    #[error(transparent)]
    Step(#[from] StepError),

    /// An operation exceeded its total processing budget and was failed.
    #[error("operation {0} has reached the time limit")]
    OperationTimeout(String),

    /// An invariant was broken; the current batch stops.
    #[error("{0}")]
    Fatal(String),

    /// Several independent failures, reported together.
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Permanent,
            Error::Storage(e) => e.kind(),
            Error::Cluster(e) => e.kind(),
            Error::ClusterAccess(e) => e.kind(),
            Error::Client(e) => e.kind(),
            Error::AccountPool(e) => e.kind(),
            Error::Step(e) => e.kind(),
            Error::OperationTimeout(_) => ErrorKind::Permanent,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Aggregate(errors) => errors
                .iter()
                .map(Error::kind)
                .find(|kind| *kind == ErrorKind::Fatal)
                .unwrap_or(ErrorKind::Permanent),
            Error::Other(_) => ErrorKind::Permanent,
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type using keb-process Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal outcome of a step.
///
/// Backoffs are not errors: a step asking to be retried returns `Ok` with a
/// non-zero delay.
#[derive(Debug, Error)]
pub enum StepError {
    /// The operation was moved to `Failed` and persisted.
    #[error("step {step} failed the operation: {reason}")]
    OperationFailed {
        operation: Box<Operation>,
        step: String,
        component: ErrorComponent,
        reason: String,
    },

    /// Storage failed in a way the step cannot recover from by waiting.
    #[error("step {step}: {source}")]
    Storage {
        step: String,
        #[source]
        source: StorageError,
    },
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::OperationFailed { .. } => ErrorKind::Permanent,
            StepError::Storage { source, .. } => source.kind(),
        }
    }

    /// Name of the step that produced the error.
    pub fn step(&self) -> &str {
        match self {
            StepError::OperationFailed { step, .. } | StepError::Storage { step, .. } => step,
        }
    }

    /// System the failure is attributed to.
    pub fn component(&self) -> ErrorComponent {
        match self {
            StepError::OperationFailed { component, .. } => *component,
            StepError::Storage { .. } => ErrorComponent::KebDb,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            StepError::OperationFailed { reason, .. } => reason.clone(),
            StepError::Storage { source, .. } => source.to_string(),
        }
    }
}
