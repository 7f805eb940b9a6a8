//! Service Catalog - reconciliation controller for Open Service Broker backed services
//!
//! The controller watches brokers, service instances and service bindings and
//! drives each toward its declared state by calling the brokers over the Open
//! Service Broker API. Brokers advertise a catalog of classes and plans;
//! instances are provisioned against a plan; bindings fetch credentials for an
//! instance and store them in a Secret.
//!
//! # Architecture
//!
//! - Informers cache every kind and enqueue keys on change
//! - A dispatcher runs a rate-limited work queue and worker pool per kind
//! - Reconcilers read cached objects, persist intent to status before each
//!   broker call, and return an action or a classified error
//! - Ambiguous provision and bind outcomes trigger orphan mitigation: the
//!   controller deprovisions or unbinds before trying anything else
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ClusterServiceBroker, ServiceInstance, etc.)
//! - [`controller`] - Broker, instance and binding reconcilers
//! - [`broker`] - Broker client abstraction and the OSB HTTP client
//! - [`dispatcher`] - Per-kind work queues and worker pools
//! - [`queue`] - Deduplicating delayed work queue
//! - [`retry`] - Exponential per-key backoff
//! - [`informer`] - Watch streams feeding caches and queues
//! - [`store`] - Cached reads and optimistic-concurrency writes
//! - [`secrets`] - Secret reads and credential writes
//! - [`defaults`] - Defaulting applied before reconcile
//! - [`config`] - Timing policy and retry budgets
//! - [`error`] - Error types and their retry classes

#![deny(missing_docs)]

pub mod broker;
pub mod config;
pub mod controller;
pub mod crd;
pub mod defaults;
pub mod dispatcher;
pub mod error;
pub mod informer;
pub mod queue;
pub mod retry;
pub mod secrets;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
