//! ServiceInstance Custom Resource Definition
//!
//! A ServiceInstance asks a broker to provision one instance of a class/plan.
//! Its status records the provisioning state machine: the operation in flight,
//! what was sent to the broker, and what the broker last confirmed.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ClusterObjectReference, Condition, DeprovisionStatus, InstanceOperation, Parameters,
    ParametersFromSource, ProvisionStatus, UserInfo,
};

/// Specification for a ServiceInstance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    plural = "serviceinstances",
    status = "ServiceInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.clusterServiceClassExternalName"}"#,
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.clusterServicePlanExternalName"}"#,
    printcolumn = r#"{"name":"Provisioned","type":"string","jsonPath":".status.provisionStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Class by catalog name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_name: Option<String>,

    /// Plan by catalog name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_name: Option<String>,

    /// Class by object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_name: Option<String>,

    /// Plan by object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_name: Option<String>,

    /// Resolved class, written by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_ref: Option<ClusterObjectReference>,

    /// Resolved plan, written by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_ref: Option<ClusterObjectReference>,

    /// Inline provision parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,

    /// Additional parameter sources merged with `parameters`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Identity sent to the broker as the instance id
    #[serde(default, rename = "externalID")]
    pub external_id: String,

    /// User who last changed the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

impl ServiceInstanceSpec {
    /// True when the spec names a class by any of the supported fields
    pub fn has_class_reference(&self) -> bool {
        self.cluster_service_class_external_name.is_some()
            || self.cluster_service_class_name.is_some()
    }

    /// True when the spec names a plan by any of the supported fields
    pub fn has_plan_reference(&self) -> bool {
        self.cluster_service_plan_external_name.is_some()
            || self.cluster_service_plan_name.is_some()
    }
}

/// Snapshot of what was sent to, or confirmed by, the broker for an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstancePropertiesState {
    /// Plan catalog name
    #[serde(default)]
    pub cluster_service_plan_external_name: String,

    /// Plan broker id
    #[serde(default, rename = "clusterServicePlanExternalID")]
    pub cluster_service_plan_external_id: String,

    /// Parameters with secret-sourced values redacted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,

    /// SHA-256 of the full parameter set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,

    /// User who triggered the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Status for a ServiceInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Ordered conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// An asynchronous broker operation is being polled
    #[serde(default)]
    pub async_op_in_progress: bool,

    /// A mitigating deprovision is running after an ambiguous provision
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    /// Operation token returned by the broker for polling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    /// Dashboard returned on provision
    #[serde(default, rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    /// Operation in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<InstanceOperation>,

    /// Generation most recently acted upon
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Generation most recently observed
    #[serde(default)]
    pub observed_generation: i64,

    /// Start of the in-flight operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    /// What is being sent to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<ServiceInstancePropertiesState>,

    /// What the broker last confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<ServiceInstancePropertiesState>,

    /// Whether the broker holds the instance
    #[serde(default)]
    pub provision_status: ProvisionStatus,

    /// Deprovision obligation
    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,

    /// Failed attempts of the current operation
    #[serde(default, skip_serializing_if = "is_zero")]
    pub operation_attempts: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ServiceInstance {
    /// Status, or the default empty status for a brand new object
    pub fn status_or_default(&self) -> ServiceInstanceStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current generation from metadata
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// True once a deletion timestamp is set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
