// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instances and the provisioning request they were created from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Email suffix that identifies internal users.
pub const INTERNAL_USER_DOMAIN: &str = "@sap.com";

/// Service-manager operator credentials handed over in the user context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManagerOperatorCredentials {
    #[serde(rename = "clientid", default)]
    pub client_id: String,
    #[serde(rename = "clientsecret", default)]
    pub client_secret: String,
    #[serde(default)]
    pub sm_url: String,
    /// Token endpoint of the service manager.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub xsappname: String,
}

/// User context sent by the platform with every lifecycle request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErsContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subaccount_id: Option<String>,
    #[serde(
        rename = "globalaccount_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub global_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sm_operator_credentials: Option<ServiceManagerOperatorCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commercial_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ErsContext {
    /// Fill every unset field from `previous`.
    ///
    /// Deprovisioning requests usually carry a thin context; the credentials and
    /// account data of the last finished operation stay authoritative.
    pub fn inherit_missing(&mut self, previous: &ErsContext) {
        fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if target.is_none() {
                target.clone_from(source);
            }
        }

        fill(&mut self.tenant_id, &previous.tenant_id);
        fill(&mut self.subaccount_id, &previous.subaccount_id);
        fill(&mut self.global_account_id, &previous.global_account_id);
        fill(
            &mut self.sm_operator_credentials,
            &previous.sm_operator_credentials,
        );
        fill(&mut self.active, &previous.active);
        fill(&mut self.user_id, &previous.user_id);
        fill(&mut self.commercial_model, &previous.commercial_model);
        fill(&mut self.license_type, &previous.license_type);
        fill(&mut self.origin, &previous.origin);
        fill(&mut self.platform, &previous.platform);
        fill(&mut self.region, &previous.region);
    }

    /// User id, or an empty string.
    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or("")
    }
}

/// Plan parameters chosen by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanParameters {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot_domain: Option<String>,
    /// Cluster access for the own-cluster plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Parameters this crate does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Full provisioning request body, stored encrypted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningParameters {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub ers_context: ErsContext,
    #[serde(default)]
    pub parameters: PlanParameters,
    /// Subaccount region, e.g. `cf-eu10`.
    #[serde(default)]
    pub platform_region: String,
    #[serde(default)]
    pub platform_provider: String,
}

impl ProvisioningParameters {
    /// Service-manager credentials, when the user context carries them.
    pub fn sm_credentials(&self) -> Option<&ServiceManagerOperatorCredentials> {
        self.ers_context.sm_operator_credentials.as_ref()
    }
}

/// Runtime facts gathered while provisioning; copied onto every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    #[serde(default)]
    pub subaccount_id: String,
    #[serde(default)]
    pub runtime_id: String,
    #[serde(default)]
    pub shoot_name: String,
    #[serde(default)]
    pub shoot_domain: String,
    /// Provider region of the cluster.
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub sm_cluster_id: String,
    #[serde(default)]
    pub kyma_resource_namespace: String,
    #[serde(default)]
    pub kyma_resource_name: String,
    #[serde(default)]
    pub gardener_cluster_name: String,
    #[serde(default)]
    pub runtime_resource_name: String,
    #[serde(default)]
    pub eu_access: bool,
    /// Admin kubeconfig; encrypted at rest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
}

/// A provisioned tenant environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_id: String,
    /// Empty if provisioning never completed or the instance is suspended.
    pub runtime_id: String,
    pub global_account_id: String,
    pub subscription_global_account_id: String,
    pub subaccount_id: String,
    pub service_id: String,
    pub service_plan_id: String,
    pub service_plan_name: String,
    /// Cloud provider (`AWS`, `Azure`, `GCP`, `SapConvergedCloud`).
    pub provider: String,
    pub provider_region: String,
    pub parameters: ProvisioningParameters,
    pub instance_details: InstanceDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a deprovisioning could not clean up everything.
    pub deleted_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    /// Derived on read: runtime id set and the last operation is a finished non-deprovisioning.
    pub reconcilable: bool,
    pub version: i32,
}

impl Instance {
    /// A fresh instance with the given ids, as written by the provisioning side.
    pub fn new(instance_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let plan_id = plan_id.into();
        Self {
            instance_id: instance_id.into(),
            runtime_id: String::new(),
            global_account_id: String::new(),
            subscription_global_account_id: String::new(),
            subaccount_id: String::new(),
            service_id: crate::plans::KYMA_SERVICE_ID.to_string(),
            service_plan_name: crate::plans::plan_name(&plan_id).to_string(),
            parameters: ProvisioningParameters {
                plan_id: plan_id.clone(),
                service_id: crate::plans::KYMA_SERVICE_ID.to_string(),
                ..Default::default()
            },
            service_plan_id: plan_id,
            provider: String::new(),
            provider_region: String::new(),
            instance_details: InstanceDetails::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            expired_at: None,
            reconcilable: false,
            version: 0,
        }
    }

    /// Whether the instance has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inherit_missing_keeps_present_fields() {
        let mut current = ErsContext {
            user_id: Some("new@example.com".to_string()),
            ..Default::default()
        };
        let previous = ErsContext {
            user_id: Some("old@example.com".to_string()),
            subaccount_id: Some("sa-1".to_string()),
            sm_operator_credentials: Some(ServiceManagerOperatorCredentials {
                client_id: "cid".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        current.inherit_missing(&previous);

        assert_eq!(current.user_id(), "new@example.com");
        assert_eq!(current.subaccount_id.as_deref(), Some("sa-1"));
        assert_eq!(
            current.sm_operator_credentials.map(|c| c.client_id),
            Some("cid".to_string())
        );
    }

    #[test]
    fn test_provisioning_parameters_json_shape() {
        let json = serde_json::json!({
            "plan_id": crate::plans::AWS_PLAN_ID,
            "ers_context": {
                "globalaccount_id": "ga-1",
                "sm_operator_credentials": {
                    "clientid": "id",
                    "clientsecret": "secret",
                    "sm_url": "https://sm",
                    "url": "https://token",
                    "xsappname": "app"
                }
            },
            "parameters": { "name": "cluster", "machineType": "m5.xlarge" },
            "platform_region": "cf-eu10"
        });

        let params: ProvisioningParameters = serde_json::from_value(json).unwrap();
        assert_eq!(params.ers_context.global_account_id.as_deref(), Some("ga-1"));
        assert_eq!(params.sm_credentials().unwrap().client_secret, "secret");
        assert_eq!(params.parameters.extra["machineType"], "m5.xlarge");
        assert_eq!(params.platform_region, "cf-eu10");
    }
}
