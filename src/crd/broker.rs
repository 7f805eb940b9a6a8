//! ClusterServiceBroker Custom Resource Definition
//!
//! A broker is an external service speaking the Open Service Broker API. The
//! controller periodically relists its catalog into ClusterServiceClass and
//! ClusterServicePlan objects.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{go_duration, Condition, ObjectReference};

/// How the controller decides when to relist a broker's catalog
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RelistBehavior {
    /// Relist on a fixed interval (`relistDuration`)
    #[default]
    Duration,
    /// Relist only when `relistRequests` is incremented
    Manual,
}

/// Basic auth credentials stored in a Secret with `username`/`password` keys
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    /// Secret holding the credentials
    pub secret_ref: ObjectReference,
}

/// Bearer token stored in a Secret under the `token` key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BearerTokenAuthConfig {
    /// Secret holding the token
    pub secret_ref: ObjectReference,
}

/// Authentication used when talking to the broker. At most one method is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceBrokerAuthInfo {
    /// HTTP basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthConfig>,
    /// Bearer token authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerTokenAuthConfig>,
}

/// Spec fields shared by every broker kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceBrokerSpec {
    /// Base URL of the broker
    pub url: String,

    /// Skip TLS verification of the broker endpoint
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// PEM bundle used to verify the broker's serving certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Relist policy
    #[serde(default)]
    pub relist_behavior: RelistBehavior,

    /// Interval between relists when `relistBehavior` is `Duration`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "go_duration"
    )]
    #[schemars(with = "Option<String>")]
    pub relist_duration: Option<Duration>,

    /// Counter incremented by users to request a manual relist
    #[serde(default)]
    pub relist_requests: i64,
}

/// Status fields shared by every broker kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceBrokerStatus {
    /// Ordered conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation most recently acted upon
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Start of the in-flight relist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    /// Time of the last successful catalog fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,

    /// `relistRequests` value acted on by the last relist
    #[serde(default)]
    pub observed_relist_requests: i64,
}

/// Specification for a ClusterServiceBroker
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceBroker",
    plural = "clusterservicebrokers",
    status = "ClusterServiceBrokerStatus",
    namespaced = false,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    /// Fields shared with namespaced brokers
    #[serde(flatten)]
    pub common: CommonServiceBrokerSpec,

    /// Credentials for the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<ServiceBrokerAuthInfo>,
}

impl ClusterServiceBrokerSpec {
    /// Shared broker spec
    pub fn common(&self) -> &CommonServiceBrokerSpec {
        &self.common
    }

    /// Mutable shared broker spec
    pub fn common_mut(&mut self) -> &mut CommonServiceBrokerSpec {
        &mut self.common
    }
}

/// Status for a ClusterServiceBroker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerStatus {
    /// Fields shared with namespaced brokers
    #[serde(flatten)]
    pub common: CommonServiceBrokerStatus,
}

impl ClusterServiceBrokerStatus {
    /// Shared broker status
    pub fn common(&self) -> &CommonServiceBrokerStatus {
        &self.common
    }

    /// Mutable shared broker status
    pub fn common_mut(&mut self) -> &mut CommonServiceBrokerStatus {
        &mut self.common
    }
}
