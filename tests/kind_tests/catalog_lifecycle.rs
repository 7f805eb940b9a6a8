//! Integration tests for the controller driving a broker end to end
//!
//! The controller runs in-process against the cluster while a wiremock server
//! plays the broker. Catalog ids are unique per run so leftovers from earlier
//! runs never collide.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use service_catalog::config::ControllerConfig;
use service_catalog::controller::{reconcilers, Context};
use service_catalog::crd::{
    is_condition_true, ClusterServiceBroker, ClusterServiceBrokerSpec, ClusterServiceClass,
    ClusterServicePlan, CommonServiceBrokerSpec, ProvisionStatus, ServiceInstance,
    ServiceInstanceSpec, CONDITION_READY,
};
use service_catalog::dispatcher::Dispatcher;
use service_catalog::informer::{wait_for_sync, Informers};

use super::helpers::{ensure_test_cluster, unique_name, wait_for, TEST_NAMESPACE};

const TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Test Fixtures
// =============================================================================

struct RunningController {
    dispatcher: Arc<Dispatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningController {
    async fn start(client: Client) -> Self {
        let config = ControllerConfig {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let informers = Informers::new();
        let caches = informers.caches();
        let ctx = Arc::new(
            Context::builder(client.clone(), caches.clone())
                .config(config.clone())
                .build(),
        );
        let dispatcher = Arc::new(Dispatcher::new(&config, reconcilers(ctx)));
        let mut tasks = informers.start(client, Arc::clone(&dispatcher), config.resync_period);
        wait_for_sync(&caches).await.expect("caches sync");
        tasks.extend(dispatcher.start());
        Self { dispatcher, tasks }
    }

    async fn stop(self) {
        self.dispatcher.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

struct FakeBroker {
    server: MockServer,
    service_id: String,
    service_name: String,
    plan_id: String,
}

impl FakeBroker {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let broker = Self {
            server,
            service_id: unique_name("svc"),
            service_name: unique_name("mysql"),
            plan_id: unique_name("plan"),
        };

        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "services": [{
                    "id": broker.service_id,
                    "name": broker.service_name,
                    "description": "test database",
                    "bindable": true,
                    "plans": [{"id": broker.plan_id, "name": "small", "description": "1 vcpu"}]
                }]
            })))
            .mount(&broker.server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/v2/service_instances/[^/]+$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .mount(&broker.server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/v2/service_instances/[^/]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&broker.server)
            .await;

        broker
    }

    fn resource(&self, name: &str) -> ClusterServiceBroker {
        ClusterServiceBroker {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClusterServiceBrokerSpec {
                common: CommonServiceBrokerSpec {
                    url: self.server.uri(),
                    ..Default::default()
                },
                auth_info: None,
            },
            status: None,
        }
    }

    async fn calls(&self, verb: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == verb && r.url.path().starts_with("/v2/service_instances/"))
            .count()
    }
}

// =============================================================================
// Stories
// =============================================================================

/// Story: an operator registers a broker, the controller publishes its
/// catalog, an application team provisions an instance from it and later
/// deletes it, and finally the broker is removed along with its catalog
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_broker_catalog_to_provisioned_instance() {
    let client = ensure_test_cluster().await;
    let broker = FakeBroker::start().await;
    let controller = RunningController::start(client.clone()).await;

    let brokers: Api<ClusterServiceBroker> = Api::all(client.clone());
    let classes: Api<ClusterServiceClass> = Api::all(client.clone());
    let plans: Api<ClusterServicePlan> = Api::all(client.clone());
    let instances: Api<ServiceInstance> = Api::namespaced(client.clone(), TEST_NAMESPACE);

    // Chapter 1: the catalog shows up as classes and plans
    let broker_name = unique_name("broker");
    brokers
        .create(&PostParams::default(), &broker.resource(&broker_name))
        .await
        .expect("broker created");

    wait_for("broker Ready", TIMEOUT, || async {
        brokers
            .get(&broker_name)
            .await
            .ok()
            .and_then(|b| b.status)
            .is_some_and(|s| is_condition_true(&s.common.conditions, CONDITION_READY))
    })
    .await;
    let class = classes.get(&broker.service_id).await.expect("class published");
    assert_eq!(class.spec.external_name, broker.service_name);
    assert_eq!(class.spec.cluster_service_broker_name, broker_name);
    plans.get(&broker.plan_id).await.expect("plan published");

    // Chapter 2: an instance naming the class by catalog name gets provisioned
    let instance_name = unique_name("db");
    let mut instance = ServiceInstance::new(
        &instance_name,
        ServiceInstanceSpec {
            cluster_service_class_external_name: Some(broker.service_name.clone()),
            cluster_service_plan_external_name: Some("small".to_string()),
            ..Default::default()
        },
    );
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    instances
        .create(&PostParams::default(), &instance)
        .await
        .expect("instance created");

    wait_for("instance Ready", TIMEOUT, || async {
        instances
            .get(&instance_name)
            .await
            .ok()
            .and_then(|i| i.status)
            .is_some_and(|s| {
                is_condition_true(&s.conditions, CONDITION_READY)
                    && s.provision_status == ProvisionStatus::Provisioned
            })
    })
    .await;
    assert_eq!(broker.calls("PUT").await, 1, "provisioned exactly once");

    // Chapter 3: deleting the instance deprovisions it before it goes away
    instances
        .delete(&instance_name, &DeleteParams::default())
        .await
        .expect("instance delete accepted");
    wait_for("instance removed", TIMEOUT, || async {
        instances.get_opt(&instance_name).await.ok().flatten().is_none()
    })
    .await;
    assert_eq!(broker.calls("DELETE").await, 1, "deprovisioned exactly once");

    // Chapter 4: removing the broker removes what it published
    brokers
        .delete(&broker_name, &DeleteParams::default())
        .await
        .expect("broker delete accepted");
    wait_for("catalog removed", TIMEOUT, || async {
        classes.get_opt(&broker.service_id).await.ok().flatten().is_none()
            && plans.get_opt(&broker.plan_id).await.ok().flatten().is_none()
    })
    .await;

    controller.stop().await;
}
