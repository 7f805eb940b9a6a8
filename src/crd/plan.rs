//! ClusterServicePlan Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::class::ClusterServiceClass;
use super::types::ClusterObjectReference;

/// Specification for a ClusterServicePlan
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServicePlan",
    plural = "clusterserviceplans",
    status = "ClusterServicePlanStatus",
    namespaced = false,
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.clusterServiceClassRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServicePlanSpec {
    /// Broker that advertises this plan
    pub cluster_service_broker_name: String,

    /// Class this plan belongs to
    pub cluster_service_class_ref: ClusterObjectReference,

    /// Human-readable name from the catalog
    pub external_name: String,

    /// Broker-assigned identity
    #[serde(rename = "externalID")]
    pub external_id: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Overrides the class-level `bindable` flag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,

    /// Whether the plan is free of charge
    #[serde(default)]
    pub free: bool,

    /// Opaque broker metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<serde_json::Value>,

    /// JSON schema for provision parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,

    /// JSON schema for update parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,

    /// JSON schema for bind parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding_create_parameter_schema: Option<serde_json::Value>,
}

/// Status for a ClusterServicePlan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServicePlanStatus {
    /// Set when a relist no longer reports this plan
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

impl ClusterServicePlan {
    /// True when the broker no longer advertises this plan
    pub fn is_removed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    /// Effective bindability: the plan override wins over the class flag
    pub fn is_bindable(&self, class: &ClusterServiceClass) -> bool {
        self.spec.bindable.unwrap_or(class.spec.bindable)
    }
}
