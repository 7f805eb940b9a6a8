//! Watch streams that keep the caches current and feed the dispatcher
//!
//! One reflector per kind fills the [`Caches`] read by the reconcilers. Every
//! change enqueues the object itself plus the objects whose decisions depend
//! on it: bindings wait on their instance becoming Ready, and a deprovision
//! waits on the instance's bindings going away. A periodic resync enqueues
//! every cached key as a safety net for missed events.
//!
//! Updates that leave `metadata.generation` and the deletion state alone are
//! the controller's own status writes. They wake dependents but not the
//! object itself, whose next pass is already scheduled by its last result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceInstance,
};
use crate::dispatcher::{Dispatcher, ObjectKey, ResourceKind};
use crate::store::Caches;
use crate::Error;

/// Pause after a watch error before polling the stream again
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What a watch event changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    /// Created, listed, spec edited or marked for deletion
    Spec,
    /// Only status or other non-generation fields changed
    Status,
    /// Removed from the API server
    Deleted,
}

/// Generation and deletion state last seen per object
#[derive(Default)]
struct Generations(HashMap<ObjectKey, (Option<i64>, bool)>);

impl Generations {
    fn observe<K: Resource>(&mut self, obj: &K) -> Change {
        let meta = obj.meta();
        let seen = (meta.generation, meta.deletion_timestamp.is_some());
        match self.0.insert(key_of(obj), seen) {
            Some(previous) if previous == seen => Change::Status,
            _ => Change::Spec,
        }
    }

    fn forget<K: Resource>(&mut self, obj: &K) {
        self.0.remove(&key_of(obj));
    }
}

/// Key of a cached object
pub fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    let name = obj.meta().name.clone().unwrap_or_default();
    match &obj.meta().namespace {
        Some(ns) => ObjectKey::namespaced(ns.clone(), name),
        None => ObjectKey::cluster(name),
    }
}

/// Keys to reconcile after `instance` changed: the instance unless only its
/// status moved, and every binding that points at it
pub fn instance_event_keys(
    instance: &ServiceInstance,
    change: Change,
    bindings: &Store<ServiceBinding>,
) -> Vec<(ResourceKind, ObjectKey)> {
    let key = key_of(instance);
    let mut keys = Vec::new();
    if change != Change::Status {
        keys.push((ResourceKind::Instance, key.clone()));
    }
    keys.extend(
        bindings
            .state()
            .iter()
            .filter(|b| {
                b.meta().namespace == key.namespace && b.spec.instance_ref.name == key.name
            })
            .map(|b| (ResourceKind::Binding, key_of(b.as_ref()))),
    );
    keys
}

/// Keys to reconcile after `binding` changed. A binding that is going away
/// may unblock its instance's deprovision.
pub fn binding_event_keys(binding: &ServiceBinding, change: Change) -> Vec<(ResourceKind, ObjectKey)> {
    let key = key_of(binding);
    let mut keys = Vec::new();
    if change != Change::Status {
        keys.push((ResourceKind::Binding, key.clone()));
    }
    if change == Change::Deleted || binding.is_being_deleted() {
        if let Some(ns) = key.namespace {
            keys.push((
                ResourceKind::Instance,
                ObjectKey::namespaced(ns, binding.spec.instance_ref.name.clone()),
            ));
        }
    }
    keys
}

/// Every cached broker, instance and binding
pub fn resync_keys(caches: &Caches) -> Vec<(ResourceKind, ObjectKey)> {
    let brokers = caches
        .brokers
        .state()
        .into_iter()
        .map(|b| (ResourceKind::Broker, key_of(b.as_ref())));
    let instances = caches
        .instances
        .state()
        .into_iter()
        .map(|i| (ResourceKind::Instance, key_of(i.as_ref())));
    let bindings = caches
        .bindings
        .state()
        .into_iter()
        .map(|b| (ResourceKind::Binding, key_of(b.as_ref())));
    brokers.chain(instances).chain(bindings).collect()
}

/// Wait until every cache has completed its initial list
pub async fn wait_for_sync(caches: &Caches) -> Result<(), Error> {
    let dropped = |e: reflector::store::WriterDropped| {
        Error::invariant(format!("cache writer dropped before sync: {e}"))
    };
    caches.brokers.wait_until_ready().await.map_err(dropped)?;
    caches.classes.wait_until_ready().await.map_err(dropped)?;
    caches.plans.wait_until_ready().await.map_err(dropped)?;
    caches.instances.wait_until_ready().await.map_err(dropped)?;
    caches.bindings.wait_until_ready().await.map_err(dropped)?;
    Ok(())
}

/// Reflector writers paired with the caches they fill
pub struct Informers {
    caches: Caches,
    brokers: Writer<ClusterServiceBroker>,
    classes: Writer<ClusterServiceClass>,
    plans: Writer<ClusterServicePlan>,
    instances: Writer<ServiceInstance>,
    bindings: Writer<ServiceBinding>,
}

impl Default for Informers {
    fn default() -> Self {
        Self::new()
    }
}

impl Informers {
    /// Empty caches, filled once [`Informers::start`] runs
    pub fn new() -> Self {
        let (brokers_store, brokers) = reflector::store();
        let (classes_store, classes) = reflector::store();
        let (plans_store, plans) = reflector::store();
        let (instances_store, instances) = reflector::store();
        let (bindings_store, bindings) = reflector::store();
        Self {
            caches: Caches {
                brokers: brokers_store,
                classes: classes_store,
                plans: plans_store,
                instances: instances_store,
                bindings: bindings_store,
            },
            brokers,
            classes,
            plans,
            instances,
            bindings,
        }
    }

    /// Read handles for the reconcilers
    pub fn caches(&self) -> Caches {
        self.caches.clone()
    }

    /// Spawn one watch task per kind plus the periodic resync
    pub fn start(
        self,
        client: Client,
        dispatcher: Arc<Dispatcher>,
        resync_period: Duration,
    ) -> Vec<JoinHandle<()>> {
        let Informers {
            caches,
            brokers,
            classes,
            plans,
            instances,
            bindings,
        } = self;
        let mut handles = Vec::new();

        let d = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(drive(
            "ClusterServiceBroker",
            watch(Api::all(client.clone()), brokers),
            move |broker: &ClusterServiceBroker, change| {
                if change != Change::Status {
                    d.enqueue(ResourceKind::Broker, key_of(broker));
                }
            },
        )));

        handles.push(tokio::spawn(drive(
            "ClusterServiceClass",
            watch(Api::all(client.clone()), classes),
            |_: &ClusterServiceClass, _| {},
        )));
        handles.push(tokio::spawn(drive(
            "ClusterServicePlan",
            watch(Api::all(client.clone()), plans),
            |_: &ClusterServicePlan, _| {},
        )));

        let d = Arc::clone(&dispatcher);
        let binding_cache = caches.bindings.clone();
        handles.push(tokio::spawn(drive(
            "ServiceInstance",
            watch(Api::all(client.clone()), instances),
            move |instance: &ServiceInstance, change| {
                for (kind, key) in instance_event_keys(instance, change, &binding_cache) {
                    d.enqueue(kind, key);
                }
            },
        )));

        let d = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(drive(
            "ServiceBinding",
            watch(Api::all(client), bindings),
            move |binding: &ServiceBinding, change| {
                for (kind, key) in binding_event_keys(binding, change) {
                    d.enqueue(kind, key);
                }
            },
        )));

        handles.push(tokio::spawn(resync(caches, dispatcher, resync_period)));
        info!("informers started");
        handles
    }
}

fn watch<K>(api: Api<K>, writer: Writer<K>) -> impl Stream<Item = Result<Event<K>, watcher::Error>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
{
    reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()))
}

/// Poll a reflector stream forever, calling `on_change` per object event
async fn drive<K, S, F>(kind: &'static str, stream: S, mut on_change: F)
where
    K: Resource,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(&K, Change),
{
    let mut generations = Generations::default();
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(obj)) => on_change(&obj, generations.observe(&obj)),
            Ok(Event::InitApply(obj)) => {
                generations.observe(&obj);
                on_change(&obj, Change::Spec);
            }
            Ok(Event::Delete(obj)) => {
                generations.forget(&obj);
                on_change(&obj, Change::Deleted);
            }
            Ok(Event::Init) => debug!(kind, "watch (re)listing"),
            Ok(Event::InitDone) => debug!(kind, "watch listed"),
            Err(e) => {
                warn!(error = %e, kind, "watch error, will retry");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}

async fn resync(caches: Caches, dispatcher: Arc<Dispatcher>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let keys = resync_keys(&caches);
        debug!(keys = keys.len(), "periodic resync");
        for (kind, key) in keys {
            dispatcher.enqueue(kind, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterServiceBrokerSpec, LocalObjectReference, ServiceBindingSpec, ServiceInstanceSpec,
    };

    fn instance(ns: &str, name: &str) -> ServiceInstance {
        let mut obj = ServiceInstance::new(name, ServiceInstanceSpec::default());
        obj.metadata.namespace = Some(ns.into());
        obj
    }

    fn binding(ns: &str, name: &str, instance: &str) -> ServiceBinding {
        let mut obj = ServiceBinding::new(
            name,
            ServiceBindingSpec {
                instance_ref: LocalObjectReference {
                    name: instance.into(),
                },
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some(ns.into());
        obj
    }

    fn cache_of<K>(objects: Vec<K>) -> (Store<K>, Writer<K>)
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone + Default,
    {
        let (store, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&Event::Apply(obj));
        }
        (store, writer)
    }

    #[test]
    fn story_instance_change_wakes_its_bindings_only() {
        let (bindings, _writer) = cache_of(vec![
            binding("ns", "a", "db"),
            binding("ns", "b", "cache"),
            binding("other", "c", "db"),
        ]);

        let keys = instance_event_keys(&instance("ns", "db"), Change::Spec, &bindings);
        assert_eq!(
            keys,
            vec![
                (ResourceKind::Instance, ObjectKey::namespaced("ns", "db")),
                (ResourceKind::Binding, ObjectKey::namespaced("ns", "a")),
            ]
        );

        let keys = instance_event_keys(&instance("ns", "db"), Change::Status, &bindings);
        assert_eq!(keys, vec![(ResourceKind::Binding, ObjectKey::namespaced("ns", "a"))]);
    }

    #[test]
    fn story_status_writes_do_not_wake_the_writer() {
        let mut generations = Generations::default();
        let mut obj = instance("ns", "db");
        obj.metadata.generation = Some(1);
        assert_eq!(generations.observe(&obj), Change::Spec);

        obj.status = Some(Default::default());
        assert_eq!(generations.observe(&obj), Change::Status);

        obj.metadata.generation = Some(2);
        assert_eq!(generations.observe(&obj), Change::Spec);

        obj.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert_eq!(generations.observe(&obj), Change::Spec);

        generations.forget(&obj);
        assert_eq!(generations.observe(&obj), Change::Spec);
    }

    #[test]
    fn deleted_binding_wakes_its_instance() {
        let b = binding("ns", "a", "db");
        assert_eq!(binding_event_keys(&b, Change::Spec).len(), 1);
        assert!(binding_event_keys(&b, Change::Status).is_empty());
        assert_eq!(
            binding_event_keys(&b, Change::Deleted),
            vec![
                (ResourceKind::Binding, ObjectKey::namespaced("ns", "a")),
                (ResourceKind::Instance, ObjectKey::namespaced("ns", "db")),
            ]
        );
    }

    #[test]
    fn resync_covers_reconciled_kinds() {
        let (brokers, _bw) = cache_of(vec![ClusterServiceBroker::new(
            "broker",
            ClusterServiceBrokerSpec::default(),
        )]);
        let (classes, _cw) = cache_of::<ClusterServiceClass>(vec![]);
        let (plans, _pw) = cache_of::<ClusterServicePlan>(vec![]);
        let (instances, _iw) = cache_of(vec![instance("ns", "db")]);
        let (bindings, _bw2) = cache_of(vec![binding("ns", "a", "db")]);
        let caches = Caches {
            brokers,
            classes,
            plans,
            instances,
            bindings,
        };

        let mut keys = resync_keys(&caches);
        keys.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&(ResourceKind::Broker, ObjectKey::cluster("broker"))));
        assert!(keys.contains(&(ResourceKind::Binding, ObjectKey::namespaced("ns", "a"))));
    }
}
