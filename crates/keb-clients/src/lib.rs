// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KEB Clients - external collaborators of the broker back-plane
//!
//! Everything the pipeline, the archiver and the reconciler talk to outside
//! their own database lives here, each behind a trait with an HTTP or `kube`
//! implementation and an in-memory fake.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          keb-process                             │
//! └──────────────────────────────────────────────────────────────────┘
//!        │              │             │            │            │
//!        ▼              ▼             ▼            ▼            ▼
//! ┌─────────────┐ ┌───────────┐ ┌──────────┐ ┌──────────┐ ┌───────────┐
//! │ cluster     │ │provisioner│ │   edp    │ │  broker  │ │hyperscaler│
//! │ (kube)      │ │ (GraphQL) │ │  (REST)  │ │  (OSB)   │ │ (gardener)│
//! └─────────────┘ └───────────┘ └──────────┘ └──────────┘ └───────────┘
//!        │                            │            │
//!        ▼                            └─────┬──────┘
//!  control plane,                           ▼
//!  tenant clusters                  oauth (client credentials)
//! ```
//!
//! # Error Classification
//!
//! [`ClientError`], [`ClusterError`](cluster::ClusterError),
//! [`ClusterAccessError`](cluster::ClusterAccessError) and
//! [`AccountPoolError`](hyperscaler::AccountPoolError) all expose
//! `kind() -> keb_core::ErrorKind`; callers branch on the kind only.
//!
//! | HTTP status | Kind |
//! |-------------|------|
//! | 404 | `NotFound` |
//! | 409 | `AlreadyExists` |
//! | 408, 429, 5xx | `Transient` |
//! | other 4xx | `Permanent` |

pub mod broker;
pub mod cluster;
pub mod edp;
pub mod error;
pub mod hyperscaler;
pub mod oauth;
pub mod provisioner;

pub use error::{ClientError, Result};
