// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deprovisioning pipeline.
//!
//! A deprovisioning operation runs through a fixed, ordered list of steps.
//! Every step is its own stage, so an operation resumed after a restart skips
//! the steps it already finished.
//!
//! ```text
//! Init
//!  └─ BTPOperator_Cleanup            (trial suspension or account cleanup)
//!      └─ Delete/Check Kyma resource          ┐
//!          └─ Delete/Check GardenerCluster    │
//!              └─ Delete/Check Runtime CR     │ permanent only
//!                  └─ Remove/Check runtime    │
//!                      └─ Release_Subscription│
//!                          └─ EDP_Deregistration
//!                              └─ Archiving
//!                                  └─ Remove_Instance
//!                                      └─ Clean
//! ```
//!
//! Cross-step state flows only through fields of the stored operation.

mod archiving;
mod btp_operator_cleanup;
mod clean;
mod edp_deregistration;
#[cfg(test)]
mod fixtures;
mod gardener_cluster;
mod init;
mod kyma_resource;
mod release_subscription;
mod remove_instance;
mod remove_runtime;
mod runtime_resource;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use keb_clients::cluster::{ClusterAccessProvider, ClusterClient};
use keb_clients::edp::{EdpClient, EdpConfig};
use keb_clients::hyperscaler::AccountProvider;
use keb_clients::provisioner::ProvisionerClient;
use keb_core::Persistence;
use keb_core::model::Operation;
use keb_core::plans;
use tracing::{error, warn};

use crate::config::{DeprovisioningConfig, StepSwitch};
use crate::error::Result;
use crate::operation_manager::since;
use crate::plan_config::PlanConfigProvider;
use crate::staged_manager::{StagedManager, StagedManagerConfig, Step, StepCondition};

pub use archiving::ArchivingStep;
pub use btp_operator_cleanup::BtpOperatorCleanupStep;
pub use clean::CleanStep;
pub use edp_deregistration::EdpDeregistrationStep;
pub use gardener_cluster::{CheckGardenerClusterDeletedStep, DeleteGardenerClusterStep};
pub use init::InitStep;
pub use kyma_resource::{CheckKymaResourceDeletedStep, DeleteKymaResourceStep};
pub use release_subscription::ReleaseSubscriptionStep;
pub use remove_instance::RemoveInstanceStep;
pub use remove_runtime::{CheckRuntimeRemovalStep, RemoveRuntimeStep};
pub use runtime_resource::{CheckRuntimeResourceDeletedStep, DeleteRuntimeResourceStep};
pub use worker::{DeprovisioningWorker, WorkerConfig};

pub const INIT_STEP: &str = "Initialisation";
pub const BTP_OPERATOR_CLEANUP_STEP: &str = "BTPOperator_Cleanup";
pub const DELETE_KYMA_RESOURCE_STEP: &str = "Delete_Kyma_Resource";
pub const CHECK_KYMA_RESOURCE_DELETED_STEP: &str = "Check_Kyma_Resource_Deleted";
pub const DELETE_GARDENER_CLUSTER_STEP: &str = "Delete_GardenerCluster";
pub const CHECK_GARDENER_CLUSTER_DELETED_STEP: &str = "Check_GardenerCluster_Deleted";
pub const DELETE_RUNTIME_RESOURCE_STEP: &str = "Delete_Runtime_Resource";
pub const CHECK_RUNTIME_RESOURCE_DELETED_STEP: &str = "Check_RuntimeResource_Deletion";
pub const REMOVE_RUNTIME_STEP: &str = "Remove_Runtime";
pub const CHECK_RUNTIME_REMOVAL_STEP: &str = "Check_Runtime_Removal";
pub const RELEASE_SUBSCRIPTION_STEP: &str = "Release_Subscription";
pub const EDP_DEREGISTRATION_STEP: &str = "EDP_Deregistration";
pub const ARCHIVING_STEP: &str = "Archiving";
pub const REMOVE_INSTANCE_STEP: &str = "Remove_Instance";
pub const CLEAN_STEP: &str = "Clean";

/// User agent of the job that removes environments of deleted accounts.
pub const ACCOUNT_CLEANUP_USER_AGENT: &str = "accountcleanup-job";

/// Namespace of the Kyma, GardenerCluster and Runtime resources when the
/// operation does not name one.
pub const KCP_NAMESPACE: &str = "kcp-system";

/// Backoff and deadline for a single control-plane call.
pub(crate) const K8S_OPERATION_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const K8S_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry budget for temporary failures of external cleanups, measured from
/// the operation's creation.
const TEMPORARY_ERROR_WINDOW: Duration = Duration::from_secs(30 * 60);
const TEMPORARY_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Backoff for a failed external cleanup.
///
/// Temporary failures are retried every ten seconds during the first thirty
/// minutes of the operation. Anything else is logged and the step gives up
/// with a zero backoff.
pub(crate) fn handle_error(
    step: &str,
    operation: &Operation,
    err: &dyn std::fmt::Display,
    temporary: bool,
    message: &str,
) -> Duration {
    if temporary && since(operation.created_at) < TEMPORARY_ERROR_WINDOW {
        warn!(step, error = %err, "{message}, retrying");
        return TEMPORARY_ERROR_BACKOFF;
    }
    error!(step, error = %err, "Step failed: {message}");
    Duration::ZERO
}

/// Step behaviour settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub operation_timeout: Duration,
    pub max_step_processing_time: Duration,
    pub kyma_resource_deletion_timeout: Duration,
    pub runtime_resource_deletion_timeout: Duration,
    pub provisioner_deprovisioning_timeout: Duration,
    pub edp: EdpConfig,
    pub subscription_release_excluded_plans: Vec<String>,
    pub archive: StepSwitch,
    pub cleaning: StepSwitch,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(24 * 3600),
            max_step_processing_time: Duration::from_secs(120),
            kyma_resource_deletion_timeout: Duration::from_secs(30),
            runtime_resource_deletion_timeout: Duration::from_secs(3600),
            provisioner_deprovisioning_timeout: Duration::from_secs(12 * 3600),
            edp: EdpConfig::default(),
            subscription_release_excluded_plans: plans::default_subscription_release_exclusions(),
            archive: StepSwitch::default(),
            cleaning: StepSwitch::default(),
        }
    }
}

impl From<&DeprovisioningConfig> for PipelineConfig {
    fn from(config: &DeprovisioningConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            max_step_processing_time: config.max_step_processing_time,
            kyma_resource_deletion_timeout: config.kyma_resource_deletion_timeout,
            runtime_resource_deletion_timeout: config.runtime_resource_deletion_timeout,
            provisioner_deprovisioning_timeout: config.provisioner_deprovisioning_timeout,
            edp: config.edp.clone(),
            subscription_release_excluded_plans: config.subscription_release_excluded_plans.clone(),
            archive: config.archive,
            cleaning: config.cleaning,
        }
    }
}

/// External systems the steps talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Persistence>,
    /// Control-plane cluster holding the Kyma, GardenerCluster and Runtime
    /// resources.
    pub kcp: Arc<dyn ClusterClient>,
    pub cluster_access: Arc<dyn ClusterAccessProvider>,
    pub plan_config: Arc<dyn PlanConfigProvider>,
    /// Legacy provisioner; without it the runtime removal steps are left out.
    pub provisioner: Option<Arc<dyn ProvisionerClient>>,
    pub edp: Arc<dyn EdpClient>,
    pub accounts: Arc<dyn AccountProvider>,
}

/// Steps that tear down infrastructure run only for permanent deprovisioning.
fn is_permanent(operation: &Operation) -> bool {
    !operation.temporary
}

/// In-cluster service-broker cleanup: suspension of a trial, or an account
/// cleanup request.
fn needs_btp_operator_cleanup(operation: &Operation) -> bool {
    (operation.temporary && plans::is_trial(operation.plan_id()))
        || operation.user_agent == ACCOUNT_CLEANUP_USER_AGENT
}

type Entry = (Arc<dyn Step>, Option<StepCondition>);

fn entry<S: Step + 'static>(step: S, condition: Option<StepCondition>) -> Entry {
    (Arc::new(step), condition)
}

/// Build the deprovisioning pipeline.
pub fn build_pipeline(collaborators: Collaborators, config: &PipelineConfig) -> Result<StagedManager> {
    let Collaborators {
        storage,
        kcp,
        cluster_access,
        plan_config,
        provisioner,
        edp,
        accounts,
    } = collaborators;

    let permanent: Option<StepCondition> = Some(is_permanent);
    let mut steps = vec![
        entry(InitStep::new(storage.clone(), config.operation_timeout), None),
        entry(
            BtpOperatorCleanupStep::new(storage.clone(), cluster_access),
            Some(needs_btp_operator_cleanup),
        ),
        entry(
            DeleteKymaResourceStep::new(storage.clone(), kcp.clone(), plan_config),
            permanent,
        ),
        entry(
            CheckKymaResourceDeletedStep::new(
                storage.clone(),
                kcp.clone(),
                config.kyma_resource_deletion_timeout,
            ),
            permanent,
        ),
        entry(
            DeleteGardenerClusterStep::new(storage.clone(), kcp.clone()),
            permanent,
        ),
        entry(
            CheckGardenerClusterDeletedStep::new(storage.clone(), kcp.clone()),
            permanent,
        ),
        entry(
            DeleteRuntimeResourceStep::new(storage.clone(), kcp.clone()),
            permanent,
        ),
        entry(
            CheckRuntimeResourceDeletedStep::new(
                storage.clone(),
                kcp,
                config.runtime_resource_deletion_timeout,
            ),
            permanent,
        ),
    ];

    if let Some(provisioner) = provisioner {
        steps.push(entry(
            RemoveRuntimeStep::new(
                storage.clone(),
                provisioner.clone(),
                config.provisioner_deprovisioning_timeout,
            ),
            permanent,
        ));
        steps.push(entry(
            CheckRuntimeRemovalStep::new(
                storage.clone(),
                provisioner,
                config.provisioner_deprovisioning_timeout,
            ),
            permanent,
        ));
    }

    steps.extend([
        entry(
            ReleaseSubscriptionStep::new(
                storage.clone(),
                accounts,
                config.subscription_release_excluded_plans.clone(),
            ),
            permanent,
        ),
        entry(
            EdpDeregistrationStep::new(storage.clone(), edp, config.edp.clone()),
            permanent,
        ),
        entry(ArchivingStep::new(storage.clone(), config.archive), None),
        entry(RemoveInstanceStep::new(storage.clone()), None),
        entry(CleanStep::new(storage.clone(), config.cleaning), None),
    ]);

    let mut manager = StagedManager::new(
        storage,
        StagedManagerConfig {
            max_step_processing_time: config.max_step_processing_time,
            operation_timeout: config.operation_timeout,
        },
    );
    let names: Vec<String> = steps.iter().map(|(step, _)| step.name().to_string()).collect();
    let stage_names: Vec<&str> = names.iter().map(String::as_str).collect();
    manager.define_stages(&stage_names);
    for (step, condition) in steps {
        let stage = step.name().to_string();
        manager.add_step(&stage, step, condition)?;
    }
    Ok(manager)
}
