// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KEB Core - broker state and storage
//!
//! This crate holds the state the broker back-plane works on: instances, the
//! append-mostly operation log, runtime-state snapshots and the archive of
//! deprovisioned instances.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          keb-process                             │
//! │   (deprovisioning pipeline, archiver, credential reconciler)     │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      keb-core (This Crate)                       │
//! │        model  │  plans  │  crypto  │  Persistence trait          │
//! └──────────────────────────────────────────────────────────────────┘
//!                 │                                │
//!                 ▼                                ▼
//!       ┌──────────────────┐             ┌──────────────────┐
//!       │    PostgreSQL    │             │      SQLite      │
//!       │   (production)   │             │ (embedded/tests) │
//!       └──────────────────┘             └──────────────────┘
//! ```
//!
//! # Storage Semantics
//!
//! | Error | Raised when |
//! |-------|-------------|
//! | `NotFound` | a read or delete finds no row |
//! | `AlreadyExists` | an insert violates a primary key |
//! | `Conflict` | an update carries a stale `version` |
//!
//! Instances and operations are updated with compare-and-swap on `version`;
//! each successful update increments it by one.
//!
//! # Tables
//!
//! | Table | Encrypted columns |
//! |-------|-------------------|
//! | `instances` | provisioning parameters, kubeconfig in instance details |
//! | `operations` | provisioning parameters, kubeconfig in instance details |
//! | `runtime_states` | kyma config |
//! | `instances_archived` | - |

#![warn(missing_docs)]

/// Error types and the shared error classification.
pub mod error;

/// Field-level AES-GCM encryption.
pub mod crypto;

/// Embedded database migrations.
pub mod migrations;

/// Domain entities.
#[allow(missing_docs)]
pub mod model;

/// Persistence trait and backends.
pub mod persistence;

/// Static service-plan catalogue.
#[allow(missing_docs)]
pub mod plans;

pub use crypto::FieldCipher;
pub use error::{ErrorKind, StorageError};
pub use persistence::Persistence;
