//! Integration tests for CRD operations
//!
//! These tests tell the story of how operators register brokers and how the
//! controller's writes behave against a real API server.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};

use service_catalog::crd::{
    set_condition, ClusterServiceBroker, ClusterServiceBrokerSpec, ClusterServiceBrokerStatus,
    CommonServiceBrokerSpec, Condition, ConditionStatus, RelistBehavior, ServiceInstance,
    ServiceInstanceSpec, CONDITION_READY,
};
use service_catalog::informer::Informers;
use service_catalog::store::{CatalogStore, KubeStore};
use service_catalog::Error;

use super::helpers::{ensure_test_cluster, unique_name, TEST_NAMESPACE};

// =============================================================================
// Test Fixtures
// =============================================================================

fn sample_broker(name: &str) -> ClusterServiceBroker {
    ClusterServiceBroker {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ClusterServiceBrokerSpec {
            common: CommonServiceBrokerSpec {
                url: "http://broker.example:8080".to_string(),
                relist_behavior: RelistBehavior::Manual,
                ..Default::default()
            },
            auth_info: None,
        },
        status: None,
    }
}

fn ready(mut broker: ClusterServiceBroker) -> ClusterServiceBroker {
    let status = broker
        .status
        .get_or_insert_with(ClusterServiceBrokerStatus::default);
    set_condition(
        &mut status.common.conditions,
        Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "FetchedCatalog",
            "Successfully fetched catalog entries from broker.",
        ),
    );
    broker
}

// =============================================================================
// Stories
// =============================================================================

/// Story: an operator registers a broker and reads it back unchanged
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_register_broker_round_trips_spec() {
    let client = ensure_test_cluster().await;
    let api: Api<ClusterServiceBroker> = Api::all(client);
    let name = unique_name("broker");

    let created = api
        .create(&PostParams::default(), &sample_broker(&name))
        .await
        .expect("broker created");
    assert_eq!(created.spec.common.relist_behavior, RelistBehavior::Manual);

    let fetched = api.get(&name).await.expect("broker readable");
    assert_eq!(fetched.spec, sample_broker(&name).spec);
    assert!(fetched.status.is_none());

    api.delete(&name, &DeleteParams::default()).await.ok();
}

/// Story: two writers race on the same broker status; the one holding the
/// stale copy loses with a conflict instead of overwriting the winner
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_stale_status_write_conflicts() {
    let client = ensure_test_cluster().await;
    let api: Api<ClusterServiceBroker> = Api::all(client.clone());
    let store = KubeStore::new(client, Informers::new().caches());
    let name = unique_name("broker");

    let base = api
        .create(&PostParams::default(), &sample_broker(&name))
        .await
        .expect("broker created");

    let written = store
        .update_broker_status(&base, &ready(base.clone()))
        .await
        .expect("first status write succeeds");
    assert!(written
        .status
        .as_ref()
        .is_some_and(|s| s.common.conditions.iter().any(|c| c.type_ == CONDITION_READY)));

    let mut stale = base.clone();
    stale.status = Some(ClusterServiceBrokerStatus::default());
    stale.status.as_mut().unwrap().common.reconciled_generation = 7;
    let err = store
        .update_broker_status(&base, &stale)
        .await
        .expect_err("stale write must not win");
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");

    api.delete(&name, &DeleteParams::default()).await.ok();
}

/// Story: a user creates an instance naming its class and plan by catalog
/// name; the API keeps both and leaves status to the controller
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_instance_created_with_external_names() {
    let client = ensure_test_cluster().await;
    let api: Api<ServiceInstance> = Api::namespaced(client, TEST_NAMESPACE);
    let name = unique_name("db");

    let mut instance = ServiceInstance::new(
        &name,
        ServiceInstanceSpec {
            cluster_service_class_external_name: Some("mysql".to_string()),
            cluster_service_plan_external_name: Some("small".to_string()),
            parameters: Some(BTreeMap::from([("size".to_string(), serde_json::json!(10))])),
            ..Default::default()
        },
    );
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());

    api.create(&PostParams::default(), &instance)
        .await
        .expect("instance created");
    let fetched = api.get(&name).await.expect("instance readable");
    assert_eq!(
        fetched.spec.cluster_service_plan_external_name.as_deref(),
        Some("small")
    );
    assert_eq!(
        fetched.spec.parameters.and_then(|p| p.get("size").cloned()),
        Some(serde_json::json!(10))
    );

    api.delete(&name, &DeleteParams::default()).await.ok();
}
