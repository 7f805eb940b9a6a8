//! In-memory [`CatalogStore`] for reconciler tests
//!
//! Behaves like the API server where reconcilers can observe it: every write
//! bumps `resourceVersion`, writes based on a stale object fail with
//! [`Error::Conflict`], spec changes bump `generation`, and an object being
//! deleted disappears once its last finalizer is removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::Mutex;

use crate::broker::{BrokerClient, MockBrokerClient, MockBrokerClientFactory};
use crate::config::ControllerConfig;
use crate::controller::Context;
use crate::crd::{
    set_condition, CleanupStatus, ClusterObjectReference, ClusterServiceBroker,
    ClusterServiceBrokerSpec, ClusterServiceClass, ClusterServiceClassSpec, ClusterServicePlan,
    ClusterServicePlanSpec, CommonServiceBrokerSpec, Condition, ConditionStatus,
    LocalObjectReference, ProvisionStatus, ServiceBinding, ServiceBindingSpec, ServiceInstance,
    ServiceInstancePropertiesState, ServiceInstanceSpec, ServiceInstanceStatus, CONDITION_READY,
    FINALIZER,
};
use crate::secrets::MockSecretClient;
use crate::store::CatalogStore;
use crate::Error;

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

#[derive(Default)]
struct State {
    brokers: BTreeMap<Key, ClusterServiceBroker>,
    classes: BTreeMap<Key, ClusterServiceClass>,
    plans: BTreeMap<Key, ClusterServicePlan>,
    instances: BTreeMap<Key, ServiceInstance>,
    bindings: BTreeMap<Key, ServiceBinding>,
    next_rv: u64,
    writes: Vec<String>,
    conflicts_to_inject: u32,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

fn write<K, F>(
    map: &mut BTreeMap<Key, K>,
    rv: String,
    base: &K,
    updated: &K,
    apply: F,
) -> Result<K, Error>
where
    K: Resource + Clone,
    F: FnOnce(&mut K, &K),
{
    let key = key_of(base);
    let what = format!("{}/{}", key.0, key.1);
    let stored = map
        .get_mut(&key)
        .ok_or_else(|| Error::conflict(format!("{what} (deleted)")))?;
    if stored.meta().resource_version != base.meta().resource_version {
        return Err(Error::conflict(what));
    }
    apply(stored, updated);
    stored.meta_mut().resource_version = Some(rv);

    let result = stored.clone();
    let finalized = result.meta().deletion_timestamp.is_some()
        && result.meta().finalizers.as_ref().map_or(true, |f| f.is_empty());
    if finalized {
        map.remove(&key);
    }
    Ok(result)
}

macro_rules! apply_spec {
    () => {
        |stored, updated| {
            if stored.spec != updated.spec {
                stored.spec = updated.spec.clone();
                stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
            }
            stored.metadata.finalizers = updated.metadata.finalizers.clone();
            stored.metadata.labels = updated.metadata.labels.clone();
            stored.metadata.annotations = updated.metadata.annotations.clone();
        }
    };
}

macro_rules! apply_status {
    () => {
        |stored, updated| {
            stored.status = updated.status.clone();
        }
    };
}

/// In-memory store with API-server write semantics
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn prepare<K: Resource>(state: &mut State, obj: &mut K) {
        let rv = state.bump();
        let meta = obj.meta_mut();
        meta.resource_version = Some(rv);
        if meta.generation.is_none() {
            meta.generation = Some(1);
        }
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", meta.name.clone().unwrap_or_default()));
        }
    }

    /// Seed a broker
    pub fn insert_broker(&self, mut obj: ClusterServiceBroker) -> ClusterServiceBroker {
        let mut state = self.state.lock();
        Self::prepare(&mut state, &mut obj);
        state.brokers.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Seed a class
    pub fn insert_class(&self, mut obj: ClusterServiceClass) -> ClusterServiceClass {
        let mut state = self.state.lock();
        Self::prepare(&mut state, &mut obj);
        state.classes.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Seed a plan
    pub fn insert_plan(&self, mut obj: ClusterServicePlan) -> ClusterServicePlan {
        let mut state = self.state.lock();
        Self::prepare(&mut state, &mut obj);
        state.plans.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Seed an instance
    pub fn insert_instance(&self, mut obj: ServiceInstance) -> ServiceInstance {
        let mut state = self.state.lock();
        Self::prepare(&mut state, &mut obj);
        state.instances.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Seed a binding
    pub fn insert_binding(&self, mut obj: ServiceBinding) -> ServiceBinding {
        let mut state = self.state.lock();
        Self::prepare(&mut state, &mut obj);
        state.bindings.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Simulate a user changing an instance spec (bumps generation)
    pub fn edit_instance(&self, namespace: &str, name: &str, f: impl FnOnce(&mut ServiceInstance)) {
        let mut state = self.state.lock();
        let rv = state.bump();
        if let Some(obj) = state
            .instances
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let before = obj.spec.clone();
            f(obj);
            if obj.spec != before {
                obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
            }
            obj.metadata.resource_version = Some(rv);
        }
    }

    /// Simulate a user deleting an instance
    pub fn delete_instance(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let rv = state.bump();
        let key = (namespace.to_string(), name.to_string());
        let finalized = match state.instances.get_mut(&key) {
            Some(obj) => {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(rv);
                obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
            }
            None => false,
        };
        if finalized {
            state.instances.remove(&key);
        }
    }

    /// Simulate a user deleting a binding
    pub fn delete_binding(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let rv = state.bump();
        let key = (namespace.to_string(), name.to_string());
        let finalized = match state.bindings.get_mut(&key) {
            Some(obj) => {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(rv);
                obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
            }
            None => false,
        };
        if finalized {
            state.bindings.remove(&key);
        }
    }

    /// Simulate a user deleting a broker
    pub fn delete_broker(&self, name: &str) {
        let mut state = self.state.lock();
        let rv = state.bump();
        let key = (String::new(), name.to_string());
        let finalized = match state.brokers.get_mut(&key) {
            Some(obj) => {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(rv);
                obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
            }
            None => false,
        };
        if finalized {
            state.brokers.remove(&key);
        }
    }

    /// Make the next `n` writes fail with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().conflicts_to_inject = n;
    }

    /// Every successful write, as `"<operation> <key>"`
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    fn check_injected<K: Resource>(state: &mut State, obj: &K) -> Result<(), Error> {
        if state.conflicts_to_inject > 0 {
            state.conflicts_to_inject -= 1;
            let (ns, name) = key_of(obj);
            return Err(Error::conflict(format!("{ns}/{name} (injected)")));
        }
        Ok(())
    }

    fn record<K: Resource>(state: &mut State, op: &str, obj: &K) {
        let (ns, name) = key_of(obj);
        let key = if ns.is_empty() { name } else { format!("{ns}/{name}") };
        state.writes.push(format!("{op} {key}"));
    }
}

#[async_trait]
impl CatalogStore for FakeStore {
    fn get_broker(&self, name: &str) -> Option<ClusterServiceBroker> {
        self.state
            .lock()
            .brokers
            .get(&(String::new(), name.to_string()))
            .cloned()
    }

    fn get_class(&self, name: &str) -> Option<ClusterServiceClass> {
        self.state
            .lock()
            .classes
            .get(&(String::new(), name.to_string()))
            .cloned()
    }

    fn get_plan(&self, name: &str) -> Option<ClusterServicePlan> {
        self.state
            .lock()
            .plans
            .get(&(String::new(), name.to_string()))
            .cloned()
    }

    fn list_classes(&self) -> Vec<ClusterServiceClass> {
        self.state.lock().classes.values().cloned().collect()
    }

    fn list_plans(&self) -> Vec<ClusterServicePlan> {
        self.state.lock().plans.values().cloned().collect()
    }

    fn get_instance(&self, namespace: &str, name: &str) -> Option<ServiceInstance> {
        self.state
            .lock()
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list_instances(&self) -> Vec<ServiceInstance> {
        self.state.lock().instances.values().cloned().collect()
    }

    fn get_binding(&self, namespace: &str, name: &str) -> Option<ServiceBinding> {
        self.state
            .lock()
            .bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list_bindings(&self, namespace: &str) -> Vec<ServiceBinding> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, b)| b.clone())
            .collect()
    }

    async fn update_broker(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.brokers, rv, base, updated, apply_spec!())?;
        Self::record(&mut state, "update_broker", base);
        Ok(stored)
    }

    async fn update_broker_status(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.brokers, rv, base, updated, apply_status!())?;
        Self::record(&mut state, "update_broker_status", base);
        Ok(stored)
    }

    async fn create_class(&self, class: &ClusterServiceClass) -> Result<ClusterServiceClass, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, class)?;
        let key = key_of(class);
        if state.classes.contains_key(&key) {
            return Err(Error::conflict(format!("{} already exists", key.1)));
        }
        let mut obj = class.clone();
        Self::prepare(&mut state, &mut obj);
        state.classes.insert(key, obj.clone());
        Self::record(&mut state, "create_class", &obj);
        Ok(obj)
    }

    async fn update_class(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.classes, rv, base, updated, apply_spec!())?;
        Self::record(&mut state, "update_class", base);
        Ok(stored)
    }

    async fn update_class_status(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.classes, rv, base, updated, apply_status!())?;
        Self::record(&mut state, "update_class_status", base);
        Ok(stored)
    }

    async fn delete_class(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.writes.push(format!("delete_class {name}"));
        state.classes.remove(&(String::new(), name.to_string()));
        Ok(())
    }

    async fn create_plan(&self, plan: &ClusterServicePlan) -> Result<ClusterServicePlan, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, plan)?;
        let key = key_of(plan);
        if state.plans.contains_key(&key) {
            return Err(Error::conflict(format!("{} already exists", key.1)));
        }
        let mut obj = plan.clone();
        Self::prepare(&mut state, &mut obj);
        state.plans.insert(key, obj.clone());
        Self::record(&mut state, "create_plan", &obj);
        Ok(obj)
    }

    async fn update_plan(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.plans, rv, base, updated, apply_spec!())?;
        Self::record(&mut state, "update_plan", base);
        Ok(stored)
    }

    async fn update_plan_status(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.plans, rv, base, updated, apply_status!())?;
        Self::record(&mut state, "update_plan_status", base);
        Ok(stored)
    }

    async fn delete_plan(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.writes.push(format!("delete_plan {name}"));
        state.plans.remove(&(String::new(), name.to_string()));
        Ok(())
    }

    async fn update_instance(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.instances, rv, base, updated, apply_spec!())?;
        Self::record(&mut state, "update_instance", base);
        Ok(stored)
    }

    async fn update_instance_status(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.instances, rv, base, updated, apply_status!())?;
        Self::record(&mut state, "update_instance_status", base);
        Ok(stored)
    }

    async fn update_binding(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.bindings, rv, base, updated, apply_spec!())?;
        Self::record(&mut state, "update_binding", base);
        Ok(stored)
    }

    async fn update_binding_status(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error> {
        let mut state = self.state.lock();
        Self::check_injected(&mut state, base)?;
        let rv = state.bump();
        let stored = write(&mut state.bindings, rv, base, updated, apply_status!())?;
        Self::record(&mut state, "update_binding_status", base);
        Ok(stored)
    }
}

/// Namespace used by fixtures
pub const NAMESPACE: &str = "ns";

/// Broker fixture name
pub const BROKER: &str = "broker";

/// Seed a broker advertising class `class-1` ("mysql") with plans `plan-1`
/// ("small") and `plan-2` ("large")
pub fn seed_catalog(store: &FakeStore) {
    store.insert_broker(ClusterServiceBroker::new(
        BROKER,
        ClusterServiceBrokerSpec {
            common: CommonServiceBrokerSpec {
                url: "http://broker.example".into(),
                ..Default::default()
            },
            auth_info: None,
        },
    ));
    store.insert_class(ClusterServiceClass::new(
        "class-1",
        ClusterServiceClassSpec {
            cluster_service_broker_name: BROKER.into(),
            external_name: "mysql".into(),
            external_id: "class-1".into(),
            bindable: true,
            plan_updatable: true,
            ..Default::default()
        },
    ));
    for (id, name) in [("plan-1", "small"), ("plan-2", "large")] {
        store.insert_plan(ClusterServicePlan::new(
            id,
            ClusterServicePlanSpec {
                cluster_service_broker_name: BROKER.into(),
                cluster_service_class_ref: ClusterObjectReference::new("class-1"),
                external_name: name.into(),
                external_id: id.into(),
                ..Default::default()
            },
        ));
    }
}

/// Instance of mysql/small in [`NAMESPACE`]
pub fn instance(name: &str) -> ServiceInstance {
    let mut obj = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            cluster_service_class_external_name: Some("mysql".into()),
            cluster_service_plan_external_name: Some("small".into()),
            external_id: format!("{name}-id"),
            ..Default::default()
        },
    );
    obj.metadata.namespace = Some(NAMESPACE.into());
    obj
}

/// Instance already provisioned on `plan-1`, holding the finalizer
pub fn provisioned_instance(name: &str) -> ServiceInstance {
    let mut obj = instance(name);
    obj.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    obj.spec.cluster_service_class_ref = Some(ClusterObjectReference::new("class-1"));
    obj.spec.cluster_service_plan_ref = Some(ClusterObjectReference::new("plan-1"));
    let mut status = ServiceInstanceStatus {
        provision_status: ProvisionStatus::Provisioned,
        deprovision_status: CleanupStatus::Required,
        external_properties: Some(ServiceInstancePropertiesState {
            cluster_service_plan_external_name: "small".into(),
            cluster_service_plan_external_id: "plan-1".into(),
            ..Default::default()
        }),
        observed_generation: 1,
        reconciled_generation: 1,
        ..Default::default()
    };
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "ProvisionedSuccessfully",
            "The instance was provisioned successfully",
        ),
    );
    obj.status = Some(status);
    obj
}

/// Binding to `instance` in [`NAMESPACE`]
pub fn binding(name: &str, instance: &str) -> ServiceBinding {
    let mut obj = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance.into(),
            },
            secret_name: format!("{name}-secret"),
            external_id: format!("{name}-id"),
            ..Default::default()
        },
    );
    obj.metadata.namespace = Some(NAMESPACE.into());
    obj
}

/// Context wired to `store`, a broker factory that always hands out
/// `client`, and `secrets`
pub fn context(
    store: Arc<FakeStore>,
    client: MockBrokerClient,
    secrets: MockSecretClient,
) -> Context {
    let client: Arc<dyn BrokerClient> = Arc::new(client);
    let mut factory = MockBrokerClientFactory::new();
    factory
        .expect_client_for()
        .returning(move |_| Ok(Arc::clone(&client)));
    Context::for_testing(
        store,
        Arc::new(factory),
        Arc::new(secrets),
        ControllerConfig::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_instance() -> ServiceInstance {
        let mut obj = ServiceInstance::new("db", ServiceInstanceSpec::default());
        obj.metadata.namespace = Some("ns".into());
        obj
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = FakeStore::new();
        let base = store.insert_instance(bare_instance());

        let mut updated = base.clone();
        updated.spec.external_id = "ext".into();
        let fresh = store.update_instance(&base, &updated).await.unwrap();
        assert_eq!(fresh.metadata.generation, Some(2));

        let err = store.update_instance(&base, &updated).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn removing_last_finalizer_of_deleted_object_removes_it() {
        let store = FakeStore::new();
        let mut obj = bare_instance();
        obj.metadata.finalizers = Some(vec!["f".into()]);
        store.insert_instance(obj);
        store.delete_instance("ns", "db");

        let base = store.get_instance("ns", "db").unwrap();
        let mut updated = base.clone();
        updated.metadata.finalizers = Some(vec![]);
        store.update_instance(&base, &updated).await.unwrap();
        assert!(store.get_instance("ns", "db").is_none());
    }

    #[tokio::test]
    async fn injected_conflicts_fail_then_clear() {
        let store = FakeStore::new();
        let base = store.insert_instance(bare_instance());
        store.inject_conflicts(1);
        assert!(store.update_instance_status(&base, &base).await.is_err());
        assert!(store.update_instance_status(&base, &base).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }
}
