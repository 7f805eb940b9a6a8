//! Reconcilers for the service catalog resources
//!
//! Each reconciler reads the latest cached object, decides the next step of
//! its state machine, persists intent through the status writer before any
//! broker call, and reports back to the dispatcher with an [`Action`] or a
//! classified [`Error`].

pub mod binding;
pub mod broker;
pub mod instance;
mod orphan;
pub mod parameters;
pub mod status;
pub mod transform;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{Client, Resource};

use crate::broker::{BrokerClient, BrokerClientFactory, OsbClientFactory};
use crate::config::ControllerConfig;
use crate::crd::FINALIZER;
use crate::defaults::DefaultsRegistry;
use crate::dispatcher::{Action, ObjectKey, Reconciler, ResourceKind};
use crate::secrets::{KubeSecretClient, SecretClient};
use crate::store::{Caches, CatalogStore, KubeStore};
use crate::Error;

/// Controller context shared by every reconcile call
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, caches)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Cached reads and optimistic-concurrency writes
    pub store: Arc<dyn CatalogStore>,
    /// Builds broker clients from broker objects
    pub brokers: Arc<dyn BrokerClientFactory>,
    /// Secret access for parameters, credentials and auth
    pub secrets: Arc<dyn SecretClient>,
    /// Defaulting functions applied before reconcile
    pub defaults: Arc<DefaultsRegistry>,
    /// Timing policy and budgets
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, caches: Caches) -> ContextBuilder {
        ContextBuilder::new(client, caches)
    }

    /// Create a context for testing with fake collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn CatalogStore>,
        brokers: Arc<dyn BrokerClientFactory>,
        secrets: Arc<dyn SecretClient>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            brokers,
            secrets,
            defaults: Arc::new(DefaultsRegistry::standard()),
            config,
        }
    }

    /// Client for the broker named `broker_name`
    pub async fn broker_client(&self, broker_name: &str) -> Result<Arc<dyn BrokerClient>, Error> {
        let broker = self.store.get_broker(broker_name).ok_or_else(|| {
            Error::reference_not_found(format!("ClusterServiceBroker {broker_name}"))
        })?;
        self.brokers.client_for(&broker).await
    }

    /// True when an operation started at `started` has run past the retry budget
    pub fn budget_elapsed(&self, started: Option<DateTime<Utc>>) -> bool {
        started.is_some_and(|t| {
            Utc::now()
                .signed_duration_since(t)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.config.retry_budget.max_duration)
        })
    }

    /// True when `attempts` failures use up the retry budget
    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.config.retry_budget.max_attempts
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    caches: Caches,
    store: Option<Arc<dyn CatalogStore>>,
    brokers: Option<Arc<dyn BrokerClientFactory>>,
    secrets: Option<Arc<dyn SecretClient>>,
    defaults: Option<Arc<DefaultsRegistry>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client, caches: Caches) -> Self {
        Self {
            client,
            caches,
            store: None,
            brokers: None,
            secrets: None,
            defaults: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the store
    pub fn store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the broker client factory
    pub fn broker_factory(mut self, brokers: Arc<dyn BrokerClientFactory>) -> Self {
        self.brokers = Some(brokers);
        self
    }

    /// Override the secret client
    pub fn secret_client(mut self, secrets: Arc<dyn SecretClient>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Override the defaulting registry
    pub fn defaults(mut self, defaults: DefaultsRegistry) -> Self {
        self.defaults = Some(Arc::new(defaults));
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(KubeSecretClient::new(self.client.clone())));
        let brokers = self
            .brokers
            .unwrap_or_else(|| Arc::new(OsbClientFactory::new(secrets.clone(), &self.config)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeStore::new(self.client.clone(), self.caches)));
        Context {
            store,
            brokers,
            secrets,
            defaults: self
                .defaults
                .unwrap_or_else(|| Arc::new(DefaultsRegistry::standard())),
            config: self.config,
        }
    }
}

/// One reconciler per kind, ready for the dispatcher
pub fn reconcilers(ctx: Arc<Context>) -> Vec<Arc<dyn Reconciler>> {
    vec![
        Arc::new(BrokerReconciler(Arc::clone(&ctx))),
        Arc::new(InstanceReconciler(Arc::clone(&ctx))),
        Arc::new(BindingReconciler(ctx)),
    ]
}

/// Reconciles ClusterServiceBrokers and their catalogs
pub struct BrokerReconciler(pub Arc<Context>);

/// Reconciles ServiceInstances
pub struct InstanceReconciler(pub Arc<Context>);

/// Reconciles ServiceBindings
pub struct BindingReconciler(pub Arc<Context>);

#[async_trait]
impl Reconciler for BrokerReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Broker
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
        broker::reconcile(key, &self.0).await
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Instance
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
        instance::reconcile(key, &self.0).await
    }
}

#[async_trait]
impl Reconciler for BindingReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Binding
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
        binding::reconcile(key, &self.0).await
    }
}

/// True if the controller's finalizer is present
pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Copy of `obj` with the finalizer added, or `None` if already present
pub fn with_finalizer<K: Resource + Clone>(obj: &K) -> Option<K> {
    if has_finalizer(obj) {
        return None;
    }
    let mut updated = obj.clone();
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    Some(updated)
}

/// Copy of `obj` with the finalizer removed, or `None` if absent
pub fn without_finalizer<K: Resource + Clone>(obj: &K) -> Option<K> {
    if !has_finalizer(obj) {
        return None;
    }
    let mut updated = obj.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|name| name != FINALIZER);
    }
    Some(updated)
}
