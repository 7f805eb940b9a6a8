//! Open Service Broker API client over HTTP
//!
//! Maps OSB status codes onto [`BrokerError`] classes:
//!
//! - connection failures before the request was sent are `Unavailable`
//! - timeouts, 408 and 5xx on mutating calls are `Ambiguous`
//! - 422 `ConcurrencyError` is `Unavailable` (retry later)
//! - any other 4xx is `Rejected`
//!
//! Reads (catalog, polls, GET binding) never report `Ambiguous`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    BindRequest, BindingPollRequest, BrokerClient, BrokerClientFactory, BrokerError, Catalog,
    Credentials, DeprovisionRequest, GetBindingRequest, InstancePollRequest, LastOperation,
    OperationOutcome, OperationState, ProvisionRequest, ProvisionResult, RequestContext,
    UnbindRequest, UpdateInstanceRequest,
};
use crate::config::ControllerConfig;
use crate::crd::{ClusterServiceBroker, Parameters, UserInfo};
use crate::secrets::{read_key, SecretClient};
use crate::Error;

const API_VERSION_HEADER: &str = "X-Broker-API-Version";
const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

/// Broker credentials resolved from the broker's auth secret
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerAuth {
    /// No authentication
    None,
    /// HTTP basic auth
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token
    Bearer(String),
}

/// HTTP client for one broker
pub struct OsbClient {
    name: String,
    base_url: String,
    api_version: String,
    auth: BrokerAuth,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ProvisionBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    organization_guid: &'a str,
    space_guid: &'a str,
    parameters: &'a Parameters,
    context: &'a RequestContext,
}

#[derive(Serialize)]
struct UpdateBody<'a> {
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Parameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_values: Option<PreviousValues<'a>>,
    context: &'a RequestContext,
}

#[derive(Serialize)]
struct PreviousValues<'a> {
    plan_id: &'a str,
}

#[derive(Serialize)]
struct BindBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    parameters: &'a Parameters,
    context: &'a RequestContext,
}

#[derive(Default, Deserialize)]
struct ProvisionResponseBody {
    #[serde(default)]
    dashboard_url: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Default, Deserialize)]
struct AsyncResponseBody {
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Default, Deserialize)]
struct BindResponseBody {
    #[serde(default)]
    credentials: Credentials,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl OsbClient {
    /// Build a client for `broker` with already-resolved credentials
    pub fn new(
        broker: &ClusterServiceBroker,
        auth: BrokerAuth,
        timeout: Duration,
        api_version: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let common = broker.spec.common();
        if common.url.is_empty() {
            return Err(BrokerError::configuration("broker url is empty"));
        }

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if common.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &common.ca_bundle {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| BrokerError::configuration(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| BrokerError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: kube::ResourceExt::name_any(broker),
            base_url: common.url.trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            auth,
            http,
        })
    }

    fn request(&self, method: Method, path: &str, identity: Option<&UserInfo>) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, url)
            .header(API_VERSION_HEADER, &self.api_version);
        req = match &self.auth {
            BrokerAuth::None => req,
            BrokerAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            BrokerAuth::Bearer(token) => req.bearer_auth(token),
        };
        if let Some(header) = identity.and_then(originating_identity) {
            req = req.header(ORIGINATING_IDENTITY_HEADER, header);
        }
        req
    }

    async fn send(&self, req: RequestBuilder, mutating: bool) -> Result<Response, BrokerError> {
        match req.send().await {
            Ok(resp) => Ok(resp),
            Err(e) if e.is_connect() => Err(BrokerError::unavailable(format!(
                "broker {}: {e}",
                self.name
            ))),
            Err(e) if mutating => Err(BrokerError::ambiguous(format!(
                "broker {}: {e}",
                self.name
            ))),
            Err(e) => Err(BrokerError::unavailable(format!("broker {}: {e}", self.name))),
        }
    }

    async fn parse<T: DeserializeOwned + Default>(
        &self,
        resp: Response,
        mutating: bool,
    ) -> Result<T, BrokerError> {
        let bytes = resp.bytes().await.map_err(|e| {
            let msg = format!("broker {}: reading response: {e}", self.name);
            if mutating {
                BrokerError::ambiguous(msg)
            } else {
                BrokerError::unavailable(msg)
            }
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            let msg = format!("broker {}: malformed response: {e}", self.name);
            if mutating {
                BrokerError::ambiguous(msg)
            } else {
                BrokerError::unavailable(msg)
            }
        })
    }

    async fn failure(&self, resp: Response, mutating: bool) -> BrokerError {
        let status = resp.status();
        let body: ErrorBody = resp
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        classify_status(status, body.error.as_deref(), body.description, mutating)
    }
}

/// Classify a non-success HTTP status
fn classify_status(
    status: StatusCode,
    error: Option<&str>,
    description: Option<String>,
    mutating: bool,
) -> BrokerError {
    let description = description
        .or_else(|| error.map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());

    if status == StatusCode::UNPROCESSABLE_ENTITY && error == Some("ConcurrencyError") {
        return BrokerError::unavailable(format!("{status}: {description}"));
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        let msg = format!("{status}: {description}");
        return if mutating {
            BrokerError::ambiguous(msg)
        } else {
            BrokerError::unavailable(msg)
        };
    }
    if status.is_client_error() {
        return BrokerError::rejected(status.as_u16(), description);
    }
    let msg = format!("unexpected status {status}: {description}");
    if mutating {
        BrokerError::ambiguous(msg)
    } else {
        BrokerError::unavailable(msg)
    }
}

/// `X-Broker-API-Originating-Identity` value for a Kubernetes user
fn originating_identity(user: &UserInfo) -> Option<String> {
    let json = serde_json::to_vec(user).ok()?;
    Some(format!("kubernetes {}", STANDARD.encode(json)))
}

fn instance_path(instance_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}")
}

fn binding_path(instance_id: &str, binding_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}")
}

fn poll_query<'a>(
    service_id: &'a str,
    plan_id: &'a str,
    operation: Option<&'a str>,
) -> Vec<(&'static str, &'a str)> {
    let mut query = vec![("service_id", service_id), ("plan_id", plan_id)];
    if let Some(op) = operation {
        query.push(("operation", op));
    }
    query
}

#[async_trait]
impl BrokerClient for OsbClient {
    async fn get_catalog(&self) -> Result<Catalog, BrokerError> {
        let resp = self
            .send(self.request(Method::GET, "/v2/catalog", None), false)
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(self.failure(resp, false).await);
        }
        self.parse(resp, false).await
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<OperationOutcome<ProvisionResult>, BrokerError> {
        let body = ProvisionBody {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            organization_guid: &request.context.namespace,
            space_guid: &request.context.namespace,
            parameters: &request.parameters,
            context: &request.context,
        };
        let req = self
            .request(
                Method::PUT,
                &instance_path(&request.instance_id),
                request.originating_identity.as_ref(),
            )
            .query(&[("accepts_incomplete", "true")])
            .json(&body);
        let resp = self.send(req, true).await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let parsed: ProvisionResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Succeeded(ProvisionResult {
                    dashboard_url: parsed.dashboard_url,
                }))
            }
            StatusCode::ACCEPTED => {
                let parsed: ProvisionResponseBody = self.parse(resp, true).await?;
                debug!(broker = %self.name, operation = ?parsed.operation, "provision accepted");
                Ok(OperationOutcome::Accepted {
                    operation: parsed.operation,
                })
            }
            _ => Err(self.failure(resp, true).await),
        }
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<OperationOutcome<ProvisionResult>, BrokerError> {
        let body = UpdateBody {
            service_id: &request.service_id,
            plan_id: request.plan_id.as_deref(),
            parameters: request.parameters.as_ref(),
            previous_values: request
                .previous_plan_id
                .as_deref()
                .map(|plan_id| PreviousValues { plan_id }),
            context: &request.context,
        };
        let req = self
            .request(
                Method::PATCH,
                &instance_path(&request.instance_id),
                request.originating_identity.as_ref(),
            )
            .query(&[("accepts_incomplete", "true")])
            .json(&body);
        let resp = self.send(req, true).await?;

        match resp.status() {
            StatusCode::OK => {
                let parsed: ProvisionResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Succeeded(ProvisionResult {
                    dashboard_url: parsed.dashboard_url,
                }))
            }
            StatusCode::ACCEPTED => {
                let parsed: AsyncResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Accepted {
                    operation: parsed.operation,
                })
            }
            _ => Err(self.failure(resp, true).await),
        }
    }

    async fn deprovision(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<OperationOutcome<()>, BrokerError> {
        let req = self
            .request(
                Method::DELETE,
                &instance_path(&request.instance_id),
                request.originating_identity.as_ref(),
            )
            .query(&[
                ("accepts_incomplete", "true"),
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ]);
        let resp = self.send(req, true).await?;

        match resp.status() {
            StatusCode::OK | StatusCode::GONE => Ok(OperationOutcome::Succeeded(())),
            StatusCode::ACCEPTED => {
                let parsed: AsyncResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Accepted {
                    operation: parsed.operation,
                })
            }
            _ => Err(self.failure(resp, true).await),
        }
    }

    async fn poll_instance_operation(
        &self,
        request: &InstancePollRequest,
    ) -> Result<LastOperation, BrokerError> {
        let path = format!("{}/last_operation", instance_path(&request.instance_id));
        let query = poll_query(
            &request.service_id,
            &request.plan_id,
            request.operation.as_deref(),
        );
        let resp = self
            .send(self.request(Method::GET, &path, None).query(&query), false)
            .await?;

        match resp.status() {
            StatusCode::OK => self.parse_last_operation(resp).await,
            StatusCode::GONE if request.deprovisioning => {
                Ok(LastOperation::new(OperationState::Succeeded, None))
            }
            _ => Err(self.failure(resp, false).await),
        }
    }

    async fn bind(
        &self,
        request: &BindRequest,
    ) -> Result<OperationOutcome<Credentials>, BrokerError> {
        let body = BindBody {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            parameters: &request.parameters,
            context: &request.context,
        };
        let req = self
            .request(
                Method::PUT,
                &binding_path(&request.instance_id, &request.binding_id),
                request.originating_identity.as_ref(),
            )
            .query(&[("accepts_incomplete", "true")])
            .json(&body);
        let resp = self.send(req, true).await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let parsed: BindResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Succeeded(parsed.credentials))
            }
            StatusCode::ACCEPTED => {
                let parsed: BindResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Accepted {
                    operation: parsed.operation,
                })
            }
            _ => Err(self.failure(resp, true).await),
        }
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<Credentials, BrokerError> {
        let path = binding_path(&request.instance_id, &request.binding_id);
        let resp = self
            .send(self.request(Method::GET, &path, None), false)
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(self.failure(resp, false).await);
        }
        let parsed: BindResponseBody = self.parse(resp, false).await?;
        Ok(parsed.credentials)
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<OperationOutcome<()>, BrokerError> {
        let req = self
            .request(
                Method::DELETE,
                &binding_path(&request.instance_id, &request.binding_id),
                request.originating_identity.as_ref(),
            )
            .query(&[
                ("accepts_incomplete", "true"),
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ]);
        let resp = self.send(req, true).await?;

        match resp.status() {
            StatusCode::OK | StatusCode::GONE => Ok(OperationOutcome::Succeeded(())),
            StatusCode::ACCEPTED => {
                let parsed: AsyncResponseBody = self.parse(resp, true).await?;
                Ok(OperationOutcome::Accepted {
                    operation: parsed.operation,
                })
            }
            _ => Err(self.failure(resp, true).await),
        }
    }

    async fn poll_binding_operation(
        &self,
        request: &BindingPollRequest,
    ) -> Result<LastOperation, BrokerError> {
        let path = format!(
            "{}/last_operation",
            binding_path(&request.instance_id, &request.binding_id)
        );
        let query = poll_query(
            &request.service_id,
            &request.plan_id,
            request.operation.as_deref(),
        );
        let resp = self
            .send(self.request(Method::GET, &path, None).query(&query), false)
            .await?;

        match resp.status() {
            StatusCode::OK => self.parse_last_operation(resp).await,
            StatusCode::GONE if request.unbinding => {
                Ok(LastOperation::new(OperationState::Succeeded, None))
            }
            _ => Err(self.failure(resp, false).await),
        }
    }
}

impl OsbClient {
    async fn parse_last_operation(&self, resp: Response) -> Result<LastOperation, BrokerError> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BrokerError::unavailable(format!("broker {}: {e}", self.name)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BrokerError::unavailable(format!(
                "broker {}: malformed last_operation response: {e}",
                self.name
            ))
        })
    }
}

/// Builds [`OsbClient`]s, resolving auth secrets on each call
pub struct OsbClientFactory {
    secrets: Arc<dyn SecretClient>,
    timeout: Duration,
    api_version: String,
}

impl OsbClientFactory {
    /// Create a factory using the controller's timeout and API version
    pub fn new(secrets: Arc<dyn SecretClient>, config: &ControllerConfig) -> Self {
        Self {
            secrets,
            timeout: config.broker_timeout,
            api_version: config.osb_api_version.clone(),
        }
    }

    async fn resolve_auth(&self, broker: &ClusterServiceBroker) -> Result<BrokerAuth, Error> {
        let Some(auth) = &broker.spec.auth_info else {
            return Ok(BrokerAuth::None);
        };
        if let Some(basic) = &auth.basic {
            let r = &basic.secret_ref;
            let username = read_key(self.secrets.as_ref(), &r.namespace, &r.name, "username").await?;
            let password = read_key(self.secrets.as_ref(), &r.namespace, &r.name, "password").await?;
            return Ok(BrokerAuth::Basic {
                username: String::from_utf8_lossy(&username).into_owned(),
                password: String::from_utf8_lossy(&password).into_owned(),
            });
        }
        if let Some(bearer) = &auth.bearer {
            let r = &bearer.secret_ref;
            let token = read_key(self.secrets.as_ref(), &r.namespace, &r.name, "token").await?;
            return Ok(BrokerAuth::Bearer(
                String::from_utf8_lossy(&token).trim().to_string(),
            ));
        }
        warn!(
            broker = %kube::ResourceExt::name_any(broker),
            "authInfo set without basic or bearer, using no auth"
        );
        Ok(BrokerAuth::None)
    }
}

#[async_trait]
impl BrokerClientFactory for OsbClientFactory {
    async fn client_for(
        &self,
        broker: &ClusterServiceBroker,
    ) -> Result<Arc<dyn BrokerClient>, Error> {
        let auth = self.resolve_auth(broker).await?;
        let client = OsbClient::new(broker, auth, self.timeout, self.api_version.clone())?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterServiceBrokerSpec, CommonServiceBrokerSpec};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(url: &str) -> ClusterServiceBroker {
        ClusterServiceBroker::new(
            "test-broker",
            ClusterServiceBrokerSpec {
                common: CommonServiceBrokerSpec {
                    url: url.to_string(),
                    ..Default::default()
                },
                auth_info: None,
            },
        )
    }

    fn client(server: &MockServer) -> OsbClient {
        OsbClient::new(
            &broker(&server.uri()),
            BrokerAuth::Basic {
                username: "user".into(),
                password: "pass".into(),
            },
            Duration::from_secs(2),
            "2.13",
        )
        .unwrap()
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            instance_id: "inst-1".into(),
            service_id: "svc-1".into(),
            plan_id: "plan-1".into(),
            context: RequestContext::kubernetes("ns"),
            ..Default::default()
        }
    }

    #[test]
    fn status_classification() {
        let c = |code: u16, error: Option<&str>, mutating| {
            classify_status(StatusCode::from_u16(code).unwrap(), error, None, mutating)
        };
        assert!(matches!(c(400, None, true), BrokerError::Rejected { status: 400, .. }));
        assert!(matches!(c(409, None, true), BrokerError::Rejected { .. }));
        assert!(matches!(c(500, None, true), BrokerError::Ambiguous(_)));
        assert!(matches!(c(408, None, true), BrokerError::Ambiguous(_)));
        assert!(matches!(c(503, None, false), BrokerError::Unavailable(_)));
        assert!(matches!(
            c(422, Some("ConcurrencyError"), true),
            BrokerError::Unavailable(_)
        ));
        assert!(matches!(
            c(422, Some("AsyncRequired"), true),
            BrokerError::Rejected { status: 422, .. }
        ));
        assert!(matches!(c(302, None, true), BrokerError::Ambiguous(_)));
        assert!(matches!(c(302, None, false), BrokerError::Unavailable(_)));
    }

    #[test]
    fn originating_identity_is_base64_json() {
        let user = UserInfo {
            username: "alice".into(),
            uid: "1".into(),
            ..Default::default()
        };
        let header = originating_identity(&user).unwrap();
        let encoded = header.strip_prefix("kubernetes ").unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        let back: UserInfo = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn empty_url_is_a_configuration_error() {
        let result = OsbClient::new(&broker(""), BrokerAuth::None, Duration::from_secs(1), "2.13");
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }

    #[tokio::test]
    async fn catalog_is_fetched_with_version_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .and(header("X-Broker-API-Version", "2.13"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "services": [{"id": "svc-1", "name": "mysql", "plans": []}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = client(&server).get_catalog().await.unwrap();
        assert_eq!(catalog.services[0].name, "mysql");
    }

    #[tokio::test]
    async fn provision_202_returns_operation_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .and(query_param("accepts_incomplete", "true"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(serde_json::json!({"operation": "op-1"})),
            )
            .mount(&server)
            .await;

        let outcome = client(&server).provision(&provision_request()).await.unwrap();
        assert_eq!(
            outcome,
            OperationOutcome::Accepted {
                operation: Some("op-1".into())
            }
        );
    }

    #[tokio::test]
    async fn provision_201_is_synchronous_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(
                serde_json::json!({"dashboard_url": "https://dash/1"}),
            ))
            .mount(&server)
            .await;

        let outcome = client(&server).provision(&provision_request()).await.unwrap();
        assert_eq!(
            outcome,
            OperationOutcome::Succeeded(ProvisionResult {
                dashboard_url: Some("https://dash/1".into())
            })
        );
    }

    #[tokio::test]
    async fn provision_500_is_ambiguous() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .provision(&provision_request())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Ambiguous(_)));
    }

    #[tokio::test]
    async fn provision_400_is_rejected_with_description() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                serde_json::json!({"description": "plan does not exist"}),
            ))
            .mount(&server)
            .await;

        let err = client(&server)
            .provision(&provision_request())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::rejected(400, "plan does not exist"));
    }

    #[tokio::test]
    async fn deprovision_410_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/service_instances/inst-1"))
            .and(query_param("service_id", "svc-1"))
            .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .deprovision(&DeprovisionRequest {
                instance_id: "inst-1".into(),
                service_id: "svc-1".into(),
                plan_id: "plan-1".into(),
                originating_identity: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Succeeded(()));
    }

    #[tokio::test]
    async fn poll_410_only_succeeds_while_deprovisioning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/service_instances/inst-1/last_operation"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let mut request = InstancePollRequest {
            instance_id: "inst-1".into(),
            service_id: "svc-1".into(),
            plan_id: "plan-1".into(),
            operation: Some("op-1".into()),
            deprovisioning: true,
        };
        let op = client(&server)
            .poll_instance_operation(&request)
            .await
            .unwrap();
        assert_eq!(op.state, OperationState::Succeeded);

        request.deprovisioning = false;
        let err = client(&server)
            .poll_instance_operation(&request)
            .await
            .unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn bind_returns_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/inst-1/service_bindings/bind-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(
                serde_json::json!({"credentials": {"USERNAME": "johndoe", "PORT": 5432}}),
            ))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .bind(&BindRequest {
                binding_id: "bind-1".into(),
                instance_id: "inst-1".into(),
                service_id: "svc-1".into(),
                plan_id: "plan-1".into(),
                context: RequestContext::kubernetes("ns"),
                ..Default::default()
            })
            .await
            .unwrap();
        let OperationOutcome::Succeeded(creds) = outcome else {
            panic!("expected synchronous bind");
        };
        assert_eq!(creds["USERNAME"], "johndoe");
        assert_eq!(creds["PORT"], 5432);
    }

    #[tokio::test]
    async fn unreachable_broker_is_unavailable() {
        let client = OsbClient::new(
            &broker("http://127.0.0.1:1"),
            BrokerAuth::None,
            Duration::from_secs(1),
            "2.13",
        )
        .unwrap();
        let err = client.provision(&provision_request()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }
}
