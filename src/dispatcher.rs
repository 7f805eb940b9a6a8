//! Work dispatch: one queue and one reconciler per resource kind
//!
//! Keys are typed by [`ResourceKind`] and routed through a dispatch table to
//! the reconciler registered for that kind. Each kind gets its own pool of
//! workers so a slow broker for instances never starves broker relists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::error::ErrorClass;
use crate::queue::WorkQueue;
use crate::Error;

/// Resource kinds that have a reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// ClusterServiceBroker
    Broker,
    /// ServiceInstance
    Instance,
    /// ServiceBinding
    Binding,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Instance => write!(f, "instance"),
            Self::Binding => write!(f, "binding"),
        }
    }
}

/// Identity of an object in the store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Namespace, or an invariant error for keys that must be namespaced
    pub fn require_namespace(&self) -> Result<&str, Error> {
        self.namespace
            .as_deref()
            .ok_or_else(|| Error::invariant(format!("key {self} has no namespace")))
    }

    /// Parse the `namespace/name` or `name` form
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::namespaced(ns, name))
            }
            None if !raw.is_empty() => Ok(Self::cluster(raw)),
            _ => Err(Error::invariant(format!("malformed object key {raw:?}"))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What the dispatcher should do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the object changes
    AwaitChange,
    /// Reconcile again after the delay (async polling, scheduled relist)
    Requeue(Duration),
}

impl Action {
    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Reconcile again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }
}

/// Reconcile function for one resource kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Kind this reconciler handles
    fn kind(&self) -> ResourceKind;

    /// Drive the object behind `key` one step toward its desired state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error>;
}

struct Route {
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<dyn Reconciler>,
}

/// Owns the per-kind queues and runs their workers
pub struct Dispatcher {
    routes: HashMap<ResourceKind, Route>,
    workers: usize,
}

impl Dispatcher {
    /// Build a dispatcher with one queue per reconciler
    pub fn new(config: &ControllerConfig, reconcilers: Vec<Arc<dyn Reconciler>>) -> Self {
        let routes = reconcilers
            .into_iter()
            .map(|reconciler| {
                let kind = reconciler.kind();
                let queue = Arc::new(WorkQueue::new(kind.to_string(), config.backoff.clone()));
                (kind, Route { queue, reconciler })
            })
            .collect();
        Self {
            routes,
            workers: config.workers,
        }
    }

    /// Queue for `kind`, if a reconciler is registered
    pub fn queue(&self, kind: ResourceKind) -> Option<Arc<WorkQueue<ObjectKey>>> {
        self.routes.get(&kind).map(|r| Arc::clone(&r.queue))
    }

    /// Enqueue `key` for `kind`
    pub fn enqueue(&self, kind: ResourceKind, key: ObjectKey) {
        match self.routes.get(&kind) {
            Some(route) => route.queue.add(key),
            None => warn!(kind = %kind, key = %key, "no reconciler registered, dropping key"),
        }
    }

    /// Spawn the worker pools. Workers exit once their queue shuts down.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in self.routes.keys().copied() {
            for worker in 0..self.workers {
                let dispatcher = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    debug!(kind = %kind, worker, "worker started");
                    while dispatcher.process_next(kind).await {}
                    debug!(kind = %kind, worker, "worker stopped");
                }));
            }
        }
        info!(
            kinds = self.routes.len(),
            workers_per_kind = self.workers,
            "dispatcher started"
        );
        handles
    }

    /// Pull one key for `kind` and reconcile it.
    ///
    /// Returns false once the queue has shut down.
    pub async fn process_next(&self, kind: ResourceKind) -> bool {
        let Some(route) = self.routes.get(&kind) else {
            return false;
        };
        let Some(key) = route.queue.get().await else {
            return false;
        };

        let result = route.reconciler.reconcile(&key).await;
        self.handle_result(route, kind, &key, result);
        route.queue.done(&key);
        true
    }

    fn handle_result(
        &self,
        route: &Route,
        kind: ResourceKind,
        key: &ObjectKey,
        result: Result<Action, Error>,
    ) {
        match result {
            Ok(Action::AwaitChange) => route.queue.forget(key),
            Ok(Action::Requeue(delay)) => {
                route.queue.forget(key);
                route.queue.add_after(key.clone(), delay);
            }
            Err(e) => match e.class() {
                ErrorClass::Transient | ErrorClass::Ambiguous => {
                    let delay = route.queue.add_rate_limited(key.clone());
                    warn!(
                        kind = %kind,
                        key = %key,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "reconcile failed, requeueing"
                    );
                }
                ErrorClass::Terminal => {
                    warn!(kind = %kind, key = %key, error = %e, "reconcile failed terminally");
                    route.queue.forget(key);
                }
                ErrorClass::Invariant => {
                    error!(kind = %kind, key = %key, error = %e, "dropping key that cannot converge");
                    route.queue.forget(key);
                }
            },
        }
    }

    /// Stop every queue and wait for in-flight keys to finish
    pub async fn shutdown(&self) {
        let drains = self
            .routes
            .values()
            .map(|route| route.queue.shutdown_with_drain());
        futures::future::join_all(drains).await;
        info!("dispatcher drained");
    }
}
