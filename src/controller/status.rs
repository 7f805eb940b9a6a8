//! Status writer
//!
//! All status writes go through here. A write stamps the observed and
//! reconciled generations, skips the API call when nothing changed, and uses
//! the object's resourceVersion so a stale write fails with
//! [`Error::Conflict`] instead of clobbering a newer status.

use tracing::debug;

use crate::crd::{
    find_condition, set_condition, ClusterServiceBroker, ClusterServiceBrokerStatus, Condition,
    ConditionStatus, ServiceBinding, ServiceBindingStatus, ServiceInstance, ServiceInstanceStatus,
    CONDITION_FAILED, CONDITION_READY,
};
use crate::store::CatalogStore;
use crate::Error;

/// Set the Ready condition
pub fn set_ready(
    conditions: &mut Vec<Condition>,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    set_condition(
        conditions,
        Condition::new(CONDITION_READY, status, reason, message),
    )
}

/// Record a terminal failure
pub fn set_failed(conditions: &mut Vec<Condition>, reason: &str, message: impl Into<String>) -> bool {
    set_condition(
        conditions,
        Condition::new(CONDITION_FAILED, ConditionStatus::True, reason, message),
    )
}

/// Flip an existing Failed condition to False. Absent conditions stay absent.
pub fn clear_failed(conditions: &mut Vec<Condition>) -> bool {
    let Some(existing) = find_condition(conditions, CONDITION_FAILED) else {
        return false;
    };
    if existing.status == ConditionStatus::False {
        return false;
    }
    let reason = existing.reason.clone();
    set_condition(
        conditions,
        Condition::new(
            CONDITION_FAILED,
            ConditionStatus::False,
            reason,
            "Retrying after a spec change",
        ),
    )
}

/// True when the Ready condition is True
pub fn is_ready(conditions: &[Condition]) -> bool {
    crate::crd::is_condition_true(conditions, CONDITION_READY)
}

/// Persist an instance status. Returns the stored object.
pub async fn write_instance(
    store: &dyn CatalogStore,
    current: &ServiceInstance,
    mut status: ServiceInstanceStatus,
) -> Result<ServiceInstance, Error> {
    let generation = current.generation();
    status.observed_generation = generation;
    status.reconciled_generation = generation;
    if current.status.as_ref() == Some(&status) {
        return Ok(current.clone());
    }
    debug!(
        operation = ?status.current_operation,
        provision = ?status.provision_status,
        deprovision = %status.deprovision_status,
        "writing instance status"
    );
    let mut updated = current.clone();
    updated.status = Some(status);
    store.update_instance_status(current, &updated).await
}

/// Persist a binding status. Returns the stored object.
pub async fn write_binding(
    store: &dyn CatalogStore,
    current: &ServiceBinding,
    mut status: ServiceBindingStatus,
) -> Result<ServiceBinding, Error> {
    status.reconciled_generation = current.generation();
    if current.status.as_ref() == Some(&status) {
        return Ok(current.clone());
    }
    debug!(
        operation = ?status.current_operation,
        unbind = %status.unbind_status,
        "writing binding status"
    );
    let mut updated = current.clone();
    updated.status = Some(status);
    store.update_binding_status(current, &updated).await
}

/// Persist a broker status. Returns the stored object.
pub async fn write_broker(
    store: &dyn CatalogStore,
    current: &ClusterServiceBroker,
    status: ClusterServiceBrokerStatus,
) -> Result<ClusterServiceBroker, Error> {
    if current.status.as_ref() == Some(&status) {
        return Ok(current.clone());
    }
    let mut updated = current.clone();
    updated.status = Some(status);
    store.update_broker_status(current, &updated).await
}
