//! ServiceBinding Custom Resource Definition
//!
//! A ServiceBinding asks a broker for credentials to a provisioned
//! ServiceInstance and stores them in a Secret in the binding's namespace.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BindingOperation, Condition, LocalObjectReference, Parameters, ParametersFromSource,
    SecretTransform, UnbindStatus, UserInfo,
};

/// Specification for a ServiceBinding
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    plural = "servicebindings",
    status = "ServiceBindingStatus",
    namespaced,
    printcolumn = r#"{"name":"Service-Instance","type":"string","jsonPath":".spec.instanceRef.name"}"#,
    printcolumn = r#"{"name":"Secret-Name","type":"string","jsonPath":".spec.secretName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace
    pub instance_ref: LocalObjectReference,

    /// Inline bind parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,

    /// Additional parameter sources merged with `parameters`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Secret receiving the credentials, defaults to the binding name
    #[serde(default)]
    pub secret_name: String,

    /// Transformations applied to the credentials before they are stored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transform: Vec<SecretTransform>,

    /// Identity sent to the broker as the binding id
    #[serde(default, rename = "externalID")]
    pub external_id: String,

    /// User who last changed the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Snapshot of what was sent to, or confirmed by, the broker for a binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingPropertiesState {
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

/// Status for a ServiceBinding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Ordered conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// An asynchronous broker operation is being polled
    #[serde(default)]
    pub async_op_in_progress: bool,

    /// Operation token returned by the broker for polling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    /// Operation in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<BindingOperation>,

    /// Generation most recently acted upon
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Start of the in-flight operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    /// What is being sent to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<ServiceBindingPropertiesState>,

    /// What the broker last confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<ServiceBindingPropertiesState>,

    /// A mitigating unbind is running after an ambiguous bind
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    /// Unbind obligation
    #[serde(default)]
    pub unbind_status: UnbindStatus,

    /// Failed attempts of the current operation
    #[serde(default, skip_serializing_if = "is_zero")]
    pub operation_attempts: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ServiceBinding {
    /// Status, or the default empty status for a brand new object
    pub fn status_or_default(&self) -> ServiceBindingStatus {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_spec_parses_rename_transforms() {
        let spec: ServiceBindingSpec = serde_json::from_value(serde_json::json!({
            "instanceRef": {"name": "db"},
            "secretName": "db-creds",
            "secretTransform": [{"renameKey": {"from": "USERNAME", "to": "DB_USER"}}]
        }))
        .unwrap();
        assert_eq!(spec.instance_ref.name, "db");
        let rename = spec.secret_transform[0].rename_key.as_ref().unwrap();
        assert_eq!(rename.from, "USERNAME");
        assert_eq!(rename.to, "DB_USER");
    }

    #[test]
    fn unbind_status_defaults_to_not_required() {
        let status: ServiceBindingStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.unbind_status, UnbindStatus::NotRequired);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["unbindStatus"], "NotRequired");
        assert!(json.get("currentOperation").is_none());
    }
}
