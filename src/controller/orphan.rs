//! Orphan mitigation
//!
//! When a provision or bind may have reached the broker but its outcome is
//! unknown, the controller issues the matching deprovision or unbind before
//! anything else. The status keeps the mitigation flag set until that cleanup
//! has either succeeded or used up its retry budget.

use chrono::Utc;

use crate::crd::{
    set_condition, BindingOperation, CleanupStatus, Condition, ConditionStatus, InstanceOperation,
    ProvisionStatus, ServiceBindingStatus, ServiceInstanceStatus, CONDITION_ORPHAN_MITIGATION,
};

use super::status::{set_failed, set_ready};

pub(crate) const REASON_STARTING: &str = "StartingOrphanMitigation";
pub(crate) const REASON_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
pub(crate) const REASON_FAILED: &str = "OrphanMitigationFailed";

fn mitigation(status: ConditionStatus, reason: &str, message: &str) -> Condition {
    Condition::new(CONDITION_ORPHAN_MITIGATION, status, reason, message)
}

/// Switch an instance into mitigating deprovision after an ambiguous provision
pub(crate) fn begin_instance(status: &mut ServiceInstanceStatus, reason: &str, message: &str) {
    status.orphan_mitigation_in_progress = true;
    status.deprovision_status.advance(CleanupStatus::Required);
    status.current_operation = Some(InstanceOperation::Deprovision);
    status.operation_start_time = Some(Utc::now());
    status.operation_attempts = 0;
    status.async_op_in_progress = false;
    status.last_operation = None;
    set_ready(&mut status.conditions, ConditionStatus::False, reason, message);
    set_condition(
        &mut status.conditions,
        mitigation(ConditionStatus::True, REASON_STARTING, message),
    );
}

/// Close out instance mitigation. On success the instance is back to
/// not-provisioned and may be provisioned again.
pub(crate) fn finish_instance(status: &mut ServiceInstanceStatus, succeeded: bool, message: &str) {
    status.orphan_mitigation_in_progress = false;
    status.current_operation = None;
    status.operation_start_time = None;
    status.operation_attempts = 0;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.in_progress_properties = None;
    if succeeded {
        status.provision_status = ProvisionStatus::NotProvisioned;
        status.external_properties = None;
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_SUCCESSFUL,
            message,
        );
        set_condition(
            &mut status.conditions,
            mitigation(ConditionStatus::False, REASON_SUCCESSFUL, message),
        );
    } else {
        status.deprovision_status.advance(CleanupStatus::Failed);
        set_ready(&mut status.conditions, ConditionStatus::False, REASON_FAILED, message);
        set_failed(&mut status.conditions, REASON_FAILED, message);
        set_condition(
            &mut status.conditions,
            mitigation(ConditionStatus::False, REASON_FAILED, message),
        );
    }
}

/// Switch a binding into mitigating unbind after an ambiguous bind or a
/// failed credential write
pub(crate) fn begin_binding(status: &mut ServiceBindingStatus, reason: &str, message: &str) {
    status.orphan_mitigation_in_progress = true;
    status.unbind_status.advance(CleanupStatus::Required);
    status.current_operation = Some(BindingOperation::Unbind);
    status.operation_start_time = Some(Utc::now());
    status.operation_attempts = 0;
    status.async_op_in_progress = false;
    status.last_operation = None;
    set_ready(&mut status.conditions, ConditionStatus::False, reason, message);
    set_condition(
        &mut status.conditions,
        mitigation(ConditionStatus::True, REASON_STARTING, message),
    );
}

/// Close out binding mitigation
pub(crate) fn finish_binding(status: &mut ServiceBindingStatus, succeeded: bool, message: &str) {
    status.orphan_mitigation_in_progress = false;
    status.current_operation = None;
    status.operation_start_time = None;
    status.operation_attempts = 0;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.in_progress_properties = None;
    if succeeded {
        status.external_properties = None;
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_SUCCESSFUL,
            message,
        );
        set_condition(
            &mut status.conditions,
            mitigation(ConditionStatus::False, REASON_SUCCESSFUL, message),
        );
    } else {
        status.unbind_status.advance(CleanupStatus::Failed);
        set_ready(&mut status.conditions, ConditionStatus::False, REASON_FAILED, message);
        set_failed(&mut status.conditions, REASON_FAILED, message);
        set_condition(
            &mut status.conditions,
            mitigation(ConditionStatus::False, REASON_FAILED, message),
        );
    }
}
