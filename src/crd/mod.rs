//! Custom Resource Definitions for the service catalog
//!
//! Brokers, classes and plans are cluster-scoped. Instances and bindings live
//! in user namespaces.

mod binding;
mod broker;
mod class;
mod instance;
mod plan;
mod types;

pub use binding::{
    ServiceBinding, ServiceBindingPropertiesState, ServiceBindingSpec, ServiceBindingStatus,
};
pub use broker::{
    BasicAuthConfig, BearerTokenAuthConfig, ClusterServiceBroker, ClusterServiceBrokerSpec,
    ClusterServiceBrokerStatus, CommonServiceBrokerSpec, CommonServiceBrokerStatus,
    RelistBehavior, ServiceBrokerAuthInfo,
};
pub use class::{ClusterServiceClass, ClusterServiceClassSpec, ClusterServiceClassStatus};
pub use instance::{
    ServiceInstance, ServiceInstancePropertiesState, ServiceInstanceSpec, ServiceInstanceStatus,
};
pub use plan::{ClusterServicePlan, ClusterServicePlanSpec, ClusterServicePlanStatus};
pub use types::{
    find_condition, go_duration, is_condition_true, set_condition, BindingOperation, CleanupStatus,
    ClusterObjectReference, Condition, ConditionStatus, DeprovisionStatus, InstanceOperation,
    LocalObjectReference, ObjectReference, Parameters, ParametersFromSource, ProvisionStatus,
    RenameKeyTransform, SecretKeyReference, SecretTransform, UnbindStatus, UserInfo,
    CONDITION_FAILED, CONDITION_ORPHAN_MITIGATION, CONDITION_READY, DEFAULT_RELIST_DURATION,
};

/// Finalizer guarding brokers, instances and bindings until broker cleanup ran
pub const FINALIZER: &str = "kubernetes-incubator/service-catalog";

/// All CRDs served by the controller, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;

    vec![
        ClusterServiceBroker::crd(),
        ClusterServiceClass::crd(),
        ClusterServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_are_served_under_the_catalog_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 5);
        for crd in &crds {
            assert_eq!(crd.spec.group, "servicecatalog.k8s.io");
            assert_eq!(crd.spec.versions[0].name, "v1beta1");
        }
        let scopes: Vec<_> = crds.iter().map(|c| c.spec.scope.as_str()).collect();
        assert_eq!(
            scopes,
            vec!["Cluster", "Cluster", "Cluster", "Namespaced", "Namespaced"]
        );
    }
}
