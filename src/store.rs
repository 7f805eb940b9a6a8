//! Cache accessor and object writes
//!
//! Reads come from reflector caches and may be stale. Writes go to the API
//! server as JSON merge patches that carry the caller's `resourceVersion`, so a
//! write based on an outdated object fails with [`Error::Conflict`] instead of
//! overwriting someone else's change.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding,
    ServiceInstance,
};
use crate::Error;

/// Read and write access to service catalog objects.
///
/// Update methods take the object as it was read (`base`) and the desired
/// object (`updated`); only the difference is sent. They return the object as
/// stored by the server, which must be used as the base of any later write.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Cached broker
    fn get_broker(&self, name: &str) -> Option<ClusterServiceBroker>;
    /// Cached class
    fn get_class(&self, name: &str) -> Option<ClusterServiceClass>;
    /// Cached plan
    fn get_plan(&self, name: &str) -> Option<ClusterServicePlan>;
    /// All cached classes
    fn list_classes(&self) -> Vec<ClusterServiceClass>;
    /// All cached plans
    fn list_plans(&self) -> Vec<ClusterServicePlan>;
    /// Cached instance
    fn get_instance(&self, namespace: &str, name: &str) -> Option<ServiceInstance>;
    /// All cached instances
    fn list_instances(&self) -> Vec<ServiceInstance>;
    /// Cached binding
    fn get_binding(&self, namespace: &str, name: &str) -> Option<ServiceBinding>;
    /// Cached bindings in a namespace
    fn list_bindings(&self, namespace: &str) -> Vec<ServiceBinding>;

    /// Write broker metadata/spec changes
    async fn update_broker(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error>;
    /// Write broker status changes
    async fn update_broker_status(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error>;

    /// Create a class
    async fn create_class(&self, class: &ClusterServiceClass) -> Result<ClusterServiceClass, Error>;
    /// Write class spec changes
    async fn update_class(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error>;
    /// Write class status changes
    async fn update_class_status(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error>;
    /// Delete a class
    async fn delete_class(&self, name: &str) -> Result<(), Error>;

    /// Create a plan
    async fn create_plan(&self, plan: &ClusterServicePlan) -> Result<ClusterServicePlan, Error>;
    /// Write plan spec changes
    async fn update_plan(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error>;
    /// Write plan status changes
    async fn update_plan_status(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error>;
    /// Delete a plan
    async fn delete_plan(&self, name: &str) -> Result<(), Error>;

    /// Write instance metadata/spec changes
    async fn update_instance(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error>;
    /// Write instance status changes
    async fn update_instance_status(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error>;

    /// Write binding metadata/spec changes
    async fn update_binding(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error>;
    /// Write binding status changes
    async fn update_binding_status(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error>;
}

/// RFC 7386 merge patch turning `base` into `updated`.
///
/// Keys missing from `updated` become `null`; arrays and scalars are replaced
/// whole. Returns `None` when nothing changed.
pub fn merge_patch(base: &Value, updated: &Value) -> Option<Value> {
    match (base, updated) {
        (Value::Object(b), Value::Object(u)) => {
            let mut patch = Map::new();
            for (key, old) in b {
                match u.get(key) {
                    Some(new) => {
                        if let Some(diff) = merge_patch(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                }
            }
            for (key, new) in u {
                if !b.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (b, u) if b == u => None,
        (_, u) => Some(u.clone()),
    }
}

/// Patch body for an update: the diff of everything except `status` (or only
/// `status`), pinned to the base object's resourceVersion
fn update_patch<K: Resource + Serialize>(
    base: &K,
    updated: &K,
    status_only: bool,
) -> Result<Option<Value>, Error> {
    let mut b = serde_json::to_value(base)?;
    let mut u = serde_json::to_value(updated)?;
    for v in [&mut b, &mut u] {
        if let Value::Object(map) = v {
            if status_only {
                map.retain(|k, _| k == "status");
            } else {
                map.remove("status");
            }
        }
    }

    let Some(mut patch) = merge_patch(&b, &u) else {
        return Ok(None);
    };
    let rv = base
        .meta()
        .resource_version
        .clone()
        .ok_or_else(|| Error::invariant("object without resourceVersion"))?;
    if let Value::Object(map) = &mut patch {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = metadata {
            meta.insert("resourceVersion".to_string(), Value::String(rv));
        }
    }
    Ok(Some(patch))
}

fn map_write_error(e: kube::Error, what: &str) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 409 => Error::conflict(what),
        other => Error::Kube(other),
    }
}

/// Reflector caches shared with the informers
#[derive(Clone)]
pub struct Caches {
    /// Brokers
    pub brokers: Store<ClusterServiceBroker>,
    /// Classes
    pub classes: Store<ClusterServiceClass>,
    /// Plans
    pub plans: Store<ClusterServicePlan>,
    /// Instances
    pub instances: Store<ServiceInstance>,
    /// Bindings
    pub bindings: Store<ServiceBinding>,
}

/// [`CatalogStore`] backed by reflector caches and the Kubernetes API
pub struct KubeStore {
    client: Client,
    caches: Caches,
}

impl KubeStore {
    /// Create a store reading from `caches`
    pub fn new(client: Client, caches: Caches) -> Self {
        Self { client, caches }
    }

    async fn patch<K>(&self, api: Api<K>, base: &K, updated: &K, status: bool) -> Result<K, Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    {
        let what = match base.namespace() {
            Some(ns) => format!("{ns}/{}", base.name_any()),
            None => base.name_any(),
        };
        let Some(patch) = update_patch(base, updated, status)? else {
            return Ok(base.clone());
        };
        debug!(object = %what, status, "writing patch");

        let params = PatchParams::default();
        let result = if status {
            api.patch_status(&base.name_any(), &params, &Patch::Merge(&patch))
                .await
        } else {
            api.patch(&base.name_any(), &params, &Patch::Merge(&patch))
                .await
        };
        result.map_err(|e| map_write_error(e, &what))
    }

    fn instances_api(&self, obj: &ServiceInstance) -> Api<ServiceInstance> {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }

    fn bindings_api(&self, obj: &ServiceBinding) -> Api<ServiceBinding> {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }
}

fn cached<K>(store: &Store<K>, obj_ref: ObjectRef<K>) -> Option<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    store.get(&obj_ref).map(|arc| (*arc).clone())
}

fn cached_all<K>(store: &Store<K>) -> Vec<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    store.state().into_iter().map(|arc| (*arc).clone()).collect()
}

#[async_trait]
impl CatalogStore for KubeStore {
    fn get_broker(&self, name: &str) -> Option<ClusterServiceBroker> {
        cached(&self.caches.brokers, ObjectRef::new(name))
    }

    fn get_class(&self, name: &str) -> Option<ClusterServiceClass> {
        cached(&self.caches.classes, ObjectRef::new(name))
    }

    fn get_plan(&self, name: &str) -> Option<ClusterServicePlan> {
        cached(&self.caches.plans, ObjectRef::new(name))
    }

    fn list_classes(&self) -> Vec<ClusterServiceClass> {
        cached_all(&self.caches.classes)
    }

    fn list_plans(&self) -> Vec<ClusterServicePlan> {
        cached_all(&self.caches.plans)
    }

    fn get_instance(&self, namespace: &str, name: &str) -> Option<ServiceInstance> {
        cached(
            &self.caches.instances,
            ObjectRef::new(name).within(namespace),
        )
    }

    fn list_instances(&self) -> Vec<ServiceInstance> {
        cached_all(&self.caches.instances)
    }

    fn get_binding(&self, namespace: &str, name: &str) -> Option<ServiceBinding> {
        cached(&self.caches.bindings, ObjectRef::new(name).within(namespace))
    }

    fn list_bindings(&self, namespace: &str) -> Vec<ServiceBinding> {
        cached_all(&self.caches.bindings)
            .into_iter()
            .filter(|b| b.namespace().as_deref() == Some(namespace))
            .collect()
    }

    async fn update_broker(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, false)
            .await
    }

    async fn update_broker_status(
        &self,
        base: &ClusterServiceBroker,
        updated: &ClusterServiceBroker,
    ) -> Result<ClusterServiceBroker, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, true)
            .await
    }

    async fn create_class(&self, class: &ClusterServiceClass) -> Result<ClusterServiceClass, Error> {
        let api: Api<ClusterServiceClass> = Api::all(self.client.clone());
        api.create(&PostParams::default(), class)
            .await
            .map_err(|e| map_write_error(e, &class.name_any()))
    }

    async fn update_class(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, false)
            .await
    }

    async fn update_class_status(
        &self,
        base: &ClusterServiceClass,
        updated: &ClusterServiceClass,
    ) -> Result<ClusterServiceClass, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, true)
            .await
    }

    async fn delete_class(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterServiceClass> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_plan(&self, plan: &ClusterServicePlan) -> Result<ClusterServicePlan, Error> {
        let api: Api<ClusterServicePlan> = Api::all(self.client.clone());
        api.create(&PostParams::default(), plan)
            .await
            .map_err(|e| map_write_error(e, &plan.name_any()))
    }

    async fn update_plan(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, false)
            .await
    }

    async fn update_plan_status(
        &self,
        base: &ClusterServicePlan,
        updated: &ClusterServicePlan,
    ) -> Result<ClusterServicePlan, Error> {
        self.patch(Api::all(self.client.clone()), base, updated, true)
            .await
    }

    async fn delete_plan(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterServicePlan> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_instance(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error> {
        self.patch(self.instances_api(base), base, updated, false)
            .await
    }

    async fn update_instance_status(
        &self,
        base: &ServiceInstance,
        updated: &ServiceInstance,
    ) -> Result<ServiceInstance, Error> {
        self.patch(self.instances_api(base), base, updated, true)
            .await
    }

    async fn update_binding(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error> {
        self.patch(self.bindings_api(base), base, updated, false)
            .await
    }

    async fn update_binding_status(
        &self,
        base: &ServiceBinding,
        updated: &ServiceBinding,
    ) -> Result<ServiceBinding, Error> {
        self.patch(self.bindings_api(base), base, updated, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{InstanceOperation, ServiceInstanceSpec, ServiceInstanceStatus};
    use serde_json::json;

    #[test]
    fn merge_patch_nulls_removed_keys_and_skips_unchanged() {
        let base = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        let updated = json!({"a": 1, "b": {"c": 5}, "e": [1], "f": true});
        let patch = merge_patch(&base, &updated).unwrap();
        assert_eq!(
            patch,
            json!({"b": {"c": 5, "d": null}, "e": [1], "f": true})
        );
        assert!(merge_patch(&base, &base).is_none());
    }

    fn instance_with_rv(rv: &str) -> ServiceInstance {
        let mut inst = ServiceInstance::new("db", ServiceInstanceSpec::default());
        inst.metadata.namespace = Some("ns".into());
        inst.metadata.resource_version = Some(rv.into());
        inst
    }

    /// Story: clearing the current operation sends an explicit null
    #[test]
    fn story_status_patch_clears_finished_operation() {
        let mut base = instance_with_rv("7");
        base.status = Some(ServiceInstanceStatus {
            current_operation: Some(InstanceOperation::Provision),
            ..Default::default()
        });
        let mut updated = base.clone();
        updated.status = Some(ServiceInstanceStatus::default());

        let patch = update_patch(&base, &updated, true).unwrap().unwrap();
        assert_eq!(patch["status"]["currentOperation"], Value::Null);
        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert!(patch.get("spec").is_none());
    }

    #[test]
    fn spec_patch_excludes_status() {
        let base = instance_with_rv("3");
        let mut updated = base.clone();
        updated.spec.external_id = "ext-1".into();
        updated.status = Some(ServiceInstanceStatus {
            observed_generation: 4,
            ..Default::default()
        });

        let patch = update_patch(&base, &updated, false).unwrap().unwrap();
        assert_eq!(patch["spec"]["externalID"], "ext-1");
        assert!(patch.get("status").is_none());
    }

    #[test]
    fn unchanged_object_produces_no_patch() {
        let base = instance_with_rv("1");
        assert!(update_patch(&base, &base.clone(), true).unwrap().is_none());
        assert!(update_patch(&base, &base.clone(), false).unwrap().is_none());
    }
}
