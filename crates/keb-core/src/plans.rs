// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static service-plan catalogue.

/// Service id of the Kyma offering.
pub const KYMA_SERVICE_ID: &str = "47c9dcbf-ff30-448e-ab36-d3bad66ba281";

pub const GCP_PLAN_ID: &str = "ca6e5357-707f-4565-bbbd-b3ab732597c6";
pub const AWS_PLAN_ID: &str = "361c511f-f939-4621-b228-d0fb79a1fe15";
pub const AZURE_PLAN_ID: &str = "4deee563-e5ec-4731-b9b1-53b42d855f0c";
pub const AZURE_LITE_PLAN_ID: &str = "8cb22518-aa26-44c5-91a0-e669ec9bf443";
pub const TRIAL_PLAN_ID: &str = "7d55d31d-35ae-4438-bf13-6ffdfa107d9f";
pub const SAP_CONVERGED_CLOUD_PLAN_ID: &str = "03b812ac-c991-4528-b5bd-08b303523a63";
pub const FREE_PLAN_ID: &str = "b1a5764e-2ea1-4f95-94c0-2b4538b37b55";
pub const OWN_CLUSTER_PLAN_ID: &str = "03e3cb66-a4c6-4c6a-b4b0-5d42224debea";
pub const PREVIEW_PLAN_ID: &str = "5cb3d976-b85c-42ea-a636-79cadda109a9";

/// Plan id to plan name.
pub const PLANS: &[(&str, &str)] = &[
    (GCP_PLAN_ID, "gcp"),
    (AWS_PLAN_ID, "aws"),
    (AZURE_PLAN_ID, "azure"),
    (AZURE_LITE_PLAN_ID, "azure_lite"),
    (TRIAL_PLAN_ID, "trial"),
    (SAP_CONVERGED_CLOUD_PLAN_ID, "sap-converged-cloud"),
    (FREE_PLAN_ID, "free"),
    (OWN_CLUSTER_PLAN_ID, "own_cluster"),
    (PREVIEW_PLAN_ID, "preview"),
];

/// Name of a plan, or an empty string for unknown ids.
pub fn plan_name(plan_id: &str) -> &'static str {
    PLANS
        .iter()
        .find(|(id, _)| *id == plan_id)
        .map(|(_, name)| *name)
        .unwrap_or("")
}

/// Id of a plan given its name.
pub fn plan_id(name: &str) -> Option<&'static str> {
    PLANS.iter().find(|(_, n)| *n == name).map(|(id, _)| *id)
}

pub fn is_trial(plan_id: &str) -> bool {
    plan_id == TRIAL_PLAN_ID
}

pub fn is_own_cluster(plan_id: &str) -> bool {
    plan_id == OWN_CLUSTER_PLAN_ID
}

/// Plans for which no hyperscaler subscription is ever assigned.
pub fn default_subscription_release_exclusions() -> Vec<String> {
    [
        TRIAL_PLAN_ID,
        FREE_PLAN_ID,
        OWN_CLUSTER_PLAN_ID,
        SAP_CONVERGED_CLOUD_PLAN_ID,
    ]
    .iter()
    .map(|id| id.to_string())
    .collect()
}
