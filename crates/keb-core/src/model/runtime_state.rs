// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration snapshots captured during infrastructure changes.

use chrono::{DateTime, Utc};

/// Snapshot owned by exactly one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub runtime_id: String,
    pub operation_id: String,
    /// Kyma configuration; encrypted at rest.
    pub kyma_config: String,
    pub cluster_config: String,
    pub k8s_version: String,
}

impl RuntimeState {
    pub fn new(
        id: impl Into<String>,
        runtime_id: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            runtime_id: runtime_id.into(),
            operation_id: operation_id.into(),
            kyma_config: String::new(),
            cluster_config: String::new(),
            k8s_version: String::new(),
        }
    }
}
