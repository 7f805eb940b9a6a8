//! Broker client boundary
//!
//! Reconcilers talk to brokers only through [`BrokerClient`]. Every failure is
//! classified into a [`BrokerError`] so the reconcilers can tell a clear
//! rejection (terminal) from an outcome they cannot know (ambiguous) or a
//! request that never reached the broker (transient).

mod osb;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{ClusterServiceBroker, Parameters, UserInfo};
use crate::error::ErrorClass;
use crate::Error;

pub use osb::{OsbClient, OsbClientFactory};

/// Credentials returned by a successful bind
pub type Credentials = BTreeMap<String, serde_json::Value>;

/// Classified broker failure
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BrokerError {
    /// The broker understood and refused the request (4xx)
    #[error("broker rejected request with status {status}: {description}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Broker-provided description
        description: String,
    },

    /// The request may have been acted on but the outcome is unknown
    #[error("broker outcome unknown: {0}")]
    Ambiguous(String),

    /// The request did not reach the broker, or a read failed
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker cannot be contacted with its current configuration
    #[error("broker configuration error: {0}")]
    Configuration(String),
}

impl BrokerError {
    /// Create a rejection error
    pub fn rejected(status: u16, description: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            description: description.into(),
        }
    }

    /// Create an ambiguous-outcome error
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::Ambiguous(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Dispatcher classification
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. } | Self::Configuration(_) => ErrorClass::Terminal,
            Self::Ambiguous(_) => ErrorClass::Ambiguous,
            Self::Unavailable(_) => ErrorClass::Transient,
        }
    }

    /// 410 Gone, which deprovision and unbind treat as success
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Rejected { status: 410, .. })
    }
}

/// Result of a mutating broker call that the broker may finish later
#[derive(Clone, Debug, PartialEq)]
pub enum OperationOutcome<T> {
    /// The broker finished synchronously
    Succeeded(T),
    /// The broker accepted the request (202) and must be polled
    Accepted {
        /// Opaque operation token to send back when polling
        operation: Option<String>,
    },
}

/// Result of a successful provision or update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionResult {
    /// Dashboard for the instance
    pub dashboard_url: Option<String>,
}

/// State reported by a last-operation poll
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum OperationState {
    /// Still running
    #[serde(rename = "in progress")]
    InProgress,
    /// Finished successfully
    #[serde(rename = "succeeded")]
    Succeeded,
    /// Finished with an error
    #[serde(rename = "failed")]
    Failed,
}

/// Result of a last-operation poll
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LastOperation {
    /// Operation state
    pub state: OperationState,
    /// Broker-provided progress or error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LastOperation {
    /// Construct a poll result
    pub fn new(state: OperationState, description: Option<&str>) -> Self {
        Self {
            state,
            description: description.map(str::to_string),
        }
    }
}

/// Platform context sent with provision and bind requests
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestContext {
    /// Always `kubernetes`
    pub platform: String,
    /// Namespace of the requesting object
    pub namespace: String,
}

impl RequestContext {
    /// Context for an object in `namespace`
    pub fn kubernetes(namespace: impl Into<String>) -> Self {
        Self {
            platform: "kubernetes".to_string(),
            namespace: namespace.into(),
        }
    }
}

/// Provision an instance
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionRequest {
    /// Instance id (`spec.externalID`)
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Merged parameters
    pub parameters: Parameters,
    /// Platform context
    pub context: RequestContext,
    /// Identity of the requesting user
    pub originating_identity: Option<UserInfo>,
}

/// Update an instance's plan or parameters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateInstanceRequest {
    /// Instance id
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// New plan, when the plan changed
    pub plan_id: Option<String>,
    /// Merged parameters, when they changed
    pub parameters: Option<Parameters>,
    /// Plan confirmed by the broker before this update
    pub previous_plan_id: Option<String>,
    /// Platform context
    pub context: RequestContext,
    /// Identity of the requesting user
    pub originating_identity: Option<UserInfo>,
}

/// Deprovision an instance
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeprovisionRequest {
    /// Instance id
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Identity of the requesting user
    pub originating_identity: Option<UserInfo>,
}

/// Poll an instance operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstancePollRequest {
    /// Instance id
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Token returned when the operation was accepted
    pub operation: Option<String>,
    /// The operation being polled is a deprovision (410 means done)
    pub deprovisioning: bool,
}

/// Create a binding
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindRequest {
    /// Binding id (`spec.externalID`)
    pub binding_id: String,
    /// Instance id
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Merged parameters
    pub parameters: Parameters,
    /// Platform context
    pub context: RequestContext,
    /// Identity of the requesting user
    pub originating_identity: Option<UserInfo>,
}

/// Fetch credentials of an asynchronously created binding
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetBindingRequest {
    /// Instance id
    pub instance_id: String,
    /// Binding id
    pub binding_id: String,
}

/// Remove a binding
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnbindRequest {
    /// Binding id
    pub binding_id: String,
    /// Instance id
    pub instance_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Identity of the requesting user
    pub originating_identity: Option<UserInfo>,
}

/// Poll a binding operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingPollRequest {
    /// Instance id
    pub instance_id: String,
    /// Binding id
    pub binding_id: String,
    /// Class external id
    pub service_id: String,
    /// Plan external id
    pub plan_id: String,
    /// Token returned when the operation was accepted
    pub operation: Option<String>,
    /// The operation being polled is an unbind (410 means done)
    pub unbinding: bool,
}

/// Catalog advertised by a broker (`GET /v2/catalog`)
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Catalog {
    /// Advertised services
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

/// One service offering
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogService {
    /// Broker-assigned id
    pub id: String,
    /// Catalog name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Default bindability of the service's plans
    #[serde(default)]
    pub bindable: bool,
    /// Whether GET binding is supported
    #[serde(default)]
    pub bindings_retrievable: bool,
    /// Whether plan changes are supported
    #[serde(default)]
    pub plan_updateable: bool,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Required platform permissions
    #[serde(default)]
    pub requires: Vec<String>,
    /// Opaque metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Plans of this service
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

/// One plan of a service offering
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogPlan {
    /// Broker-assigned id
    pub id: String,
    /// Catalog name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Whether the plan is free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    /// Overrides the service's bindability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    /// Opaque metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Parameter schemas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<serde_json::Value>,
}

impl CatalogPlan {
    /// Schema at `pointer` within `schemas`, e.g. `/service_instance/create/parameters`
    pub fn schema(&self, pointer: &str) -> Option<serde_json::Value> {
        self.schemas.as_ref()?.pointer(pointer).cloned()
    }
}

/// Open Service Broker API operations used by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch the broker's catalog
    async fn get_catalog(&self) -> Result<Catalog, BrokerError>;

    /// Provision an instance
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<OperationOutcome<ProvisionResult>, BrokerError>;

    /// Update an instance
    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<OperationOutcome<ProvisionResult>, BrokerError>;

    /// Deprovision an instance. 410 Gone is reported as success.
    async fn deprovision(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<OperationOutcome<()>, BrokerError>;

    /// Poll an asynchronous instance operation
    async fn poll_instance_operation(
        &self,
        request: &InstancePollRequest,
    ) -> Result<LastOperation, BrokerError>;

    /// Create a binding
    async fn bind(&self, request: &BindRequest)
        -> Result<OperationOutcome<Credentials>, BrokerError>;

    /// Fetch a binding's credentials
    async fn get_binding(&self, request: &GetBindingRequest) -> Result<Credentials, BrokerError>;

    /// Remove a binding. 410 Gone is reported as success.
    async fn unbind(&self, request: &UnbindRequest) -> Result<OperationOutcome<()>, BrokerError>;

    /// Poll an asynchronous binding operation
    async fn poll_binding_operation(
        &self,
        request: &BindingPollRequest,
    ) -> Result<LastOperation, BrokerError>;
}

/// Builds a client for a specific broker object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerClientFactory: Send + Sync {
    /// Client configured with the broker's URL, TLS settings and credentials
    async fn client_for(&self, broker: &ClusterServiceBroker)
        -> Result<Arc<dyn BrokerClient>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_is_only_410() {
        assert!(BrokerError::rejected(410, "gone").is_gone());
        assert!(!BrokerError::rejected(404, "missing").is_gone());
        assert!(!BrokerError::ambiguous("timeout").is_gone());
    }

    #[test]
    fn last_operation_states_use_osb_strings() {
        let op: LastOperation =
            serde_json::from_str(r#"{"state":"in progress","description":"50%"}"#).unwrap();
        assert_eq!(op.state, OperationState::InProgress);
        assert_eq!(op.description.as_deref(), Some("50%"));

        let op: LastOperation = serde_json::from_str(r#"{"state":"failed"}"#).unwrap();
        assert_eq!(op.state, OperationState::Failed);
    }

    #[test]
    fn catalog_plan_schema_lookup() {
        let plan = CatalogPlan {
            schemas: Some(serde_json::json!({
                "service_instance": {"create": {"parameters": {"type": "object"}}}
            })),
            ..Default::default()
        };
        assert_eq!(
            plan.schema("/service_instance/create/parameters"),
            Some(serde_json::json!({"type": "object"}))
        );
        assert!(plan.schema("/service_binding/create/parameters").is_none());
    }

    #[test]
    fn catalog_parses_osb_field_names() {
        let catalog: Catalog = serde_json::from_value(serde_json::json!({
            "services": [{
                "id": "svc-1",
                "name": "mysql",
                "bindable": true,
                "plan_updateable": true,
                "bindings_retrievable": true,
                "plans": [{"id": "plan-1", "name": "small", "free": true}]
            }]
        }))
        .unwrap();
        let svc = &catalog.services[0];
        assert!(svc.plan_updateable);
        assert!(svc.bindings_retrievable);
        assert_eq!(svc.plans[0].free, Some(true));
    }
}
