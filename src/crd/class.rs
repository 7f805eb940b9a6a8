//! ClusterServiceClass Custom Resource Definition
//!
//! Classes are written by the controller from a broker's catalog. Users never
//! create them directly.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a ClusterServiceClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceClass",
    plural = "clusterserviceclasses",
    status = "ClusterServiceClassStatus",
    namespaced = false,
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.clusterServiceBrokerName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceClassSpec {
    /// Broker that advertises this class
    pub cluster_service_broker_name: String,

    /// Human-readable name from the catalog
    pub external_name: String,

    /// Broker-assigned identity
    #[serde(rename = "externalID")]
    pub external_id: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Whether instances of this class can be bound by default
    #[serde(default)]
    pub bindable: bool,

    /// Whether the broker supports fetching bindings (GET binding)
    #[serde(default)]
    pub binding_retrievable: bool,

    /// Whether instances may change plan after provisioning
    #[serde(default)]
    pub plan_updatable: bool,

    /// Opaque broker metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<serde_json::Value>,

    /// Catalog tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Platform permissions the class requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// Status for a ClusterServiceClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceClassStatus {
    /// Set when a relist no longer reports this class
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

impl ClusterServiceClass {
    /// True when the broker no longer advertises this class
    pub fn is_removed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }
}
