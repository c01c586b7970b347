// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kyma environment broker back-plane.
//!
//! Background processes that keep the broker's database and the clusters it
//! manages consistent after the synchronous API has answered:
//!
//! ```text
//! ┌───────────────────┐   ┌──────────────────────┐   ┌────────────────────────┐
//! │ keb-deprovisioner │   │ keb-runtime-reconciler│   │ keb-environments-cleanup│
//! │  staged pipeline  │   │  BTP manager secret   │   │  stale dev shoots       │
//! └─────────┬─────────┘   └───────────┬──────────┘   └───────────┬────────────┘
//!           │                         │                          │
//!           ▼                         ▼                          ▼
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │          Storage (instances, operations, runtime states, archive)       │
//! └────────────────────────────────────────────────────────────────────────┘
//!           ▲
//!           │
//! ┌─────────┴─────────┐
//! │   keb-archiver    │  operation logs of removed instances
//! └───────────────────┘
//! ```
//!
//! # Processes
//!
//! | Binary | Module | Description |
//! |--------|--------|-------------|
//! | `keb-deprovisioner` | [`deprovisioning`] | Runs deprovisioning operations through the step pipeline |
//! | `keb-archiver` | [`archive`] | Archives and purges operation logs of removed instances |
//! | `keb-runtime-reconciler` | [`credentials`] | Keeps the BTP manager secret in tenant clusters current |
//! | `keb-environments-cleanup` | [`environments_cleanup`] | Removes stale shoots on development landscapes |
//!
//! # Configuration
//!
//! Settings come from the process environment, optionally seeded from a
//! `.env` file. See [`config`] for the recognised variables.

/// Settings loaded from environment variables.
pub mod config;

/// Error types for the back-plane processes.
pub mod error;

/// Structured logging setup.
pub mod logging;

/// Opening the broker database.
pub mod storage;

/// Step bookkeeping on top of storage: retries, failures and state changes.
pub mod operation_manager;

/// Ordered, resumable execution of pipeline steps.
pub mod staged_manager;

/// Per-plan runtime configuration.
pub mod plan_config;

/// The deprovisioning pipeline and its worker.
pub mod deprovisioning;

/// Archival of operation logs of removed instances.
pub mod archive;

/// Reconciliation of service-manager credentials in tenant clusters.
pub mod credentials;

/// Removal of stale shoots on development landscapes.
pub mod environments_cleanup;

pub use error::{Error, Result};
