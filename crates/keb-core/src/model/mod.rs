// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain entities: instances, operations, runtime states and archives.

pub mod archived;
pub mod instance;
pub mod operation;
pub mod runtime_state;

pub use archived::{ArchiveError, InstanceArchived};
pub use instance::{
    ErsContext, Instance, InstanceDetails, PlanParameters, ProvisioningParameters,
    ServiceManagerOperatorCredentials,
};
pub use operation::{ErrorComponent, LastError, Operation, OperationState, OperationType};
pub use runtime_state::RuntimeState;
