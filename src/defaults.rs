//! Defaulting registry
//!
//! Defaults are plain functions registered per kind when the controller
//! starts. The registry is immutable afterwards and shared by every worker.

use crate::crd::{
    ClusterServiceBroker, RelistBehavior, ServiceBinding, ServiceInstance, DEFAULT_RELIST_DURATION,
};

/// Defaulting function; returns true when it changed the object
pub type Defaulter<K> = Box<dyn Fn(&mut K) -> bool + Send + Sync>;

/// Per-kind defaulting functions
#[derive(Default)]
pub struct DefaultsRegistry {
    brokers: Vec<Defaulter<ClusterServiceBroker>>,
    instances: Vec<Defaulter<ServiceInstance>>,
    bindings: Vec<Defaulter<ServiceBinding>>,
}

/// Kinds that can be defaulted through a [`DefaultsRegistry`]
pub trait Defaulted: Sized {
    /// Defaulters registered for this kind
    fn defaulters(registry: &DefaultsRegistry) -> &[Defaulter<Self>];
}

impl Defaulted for ClusterServiceBroker {
    fn defaulters(registry: &DefaultsRegistry) -> &[Defaulter<Self>] {
        &registry.brokers
    }
}

impl Defaulted for ServiceInstance {
    fn defaulters(registry: &DefaultsRegistry) -> &[Defaulter<Self>] {
        &registry.instances
    }
}

impl Defaulted for ServiceBinding {
    fn defaulters(registry: &DefaultsRegistry) -> &[Defaulter<Self>] {
        &registry.bindings
    }
}

impl DefaultsRegistry {
    /// Registry with no defaulters
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the controller's built-in defaults
    pub fn standard() -> Self {
        Self::empty()
            .with_broker(default_relist_policy)
            .with_instance(|instance| {
                default_external_id(&mut instance.spec.external_id)
            })
            .with_binding(|binding| default_external_id(&mut binding.spec.external_id))
            .with_binding(default_secret_name)
    }

    /// Register a broker defaulter
    pub fn with_broker(
        mut self,
        f: impl Fn(&mut ClusterServiceBroker) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.brokers.push(Box::new(f));
        self
    }

    /// Register an instance defaulter
    pub fn with_instance(
        mut self,
        f: impl Fn(&mut ServiceInstance) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.instances.push(Box::new(f));
        self
    }

    /// Register a binding defaulter
    pub fn with_binding(
        mut self,
        f: impl Fn(&mut ServiceBinding) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.bindings.push(Box::new(f));
        self
    }

    /// Run every defaulter registered for `K`. Returns true if any changed `obj`.
    pub fn apply<K: Defaulted>(&self, obj: &mut K) -> bool {
        K::defaulters(self)
            .iter()
            .fold(false, |changed, f| f(obj) || changed)
    }
}

fn default_relist_policy(broker: &mut ClusterServiceBroker) -> bool {
    let common = broker.spec.common_mut();
    if common.relist_behavior == RelistBehavior::Duration && common.relist_duration.is_none() {
        common.relist_duration = Some(DEFAULT_RELIST_DURATION);
        return true;
    }
    false
}

fn default_external_id(external_id: &mut String) -> bool {
    if external_id.is_empty() {
        *external_id = uuid::Uuid::new_v4().to_string();
        return true;
    }
    false
}

fn default_secret_name(binding: &mut ServiceBinding) -> bool {
    if binding.spec.secret_name.is_empty() {
        binding.spec.secret_name = binding.metadata.name.clone().unwrap_or_default();
        return !binding.spec.secret_name.is_empty();
    }
    false
}
