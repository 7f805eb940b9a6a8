//! ServiceInstance reconciliation
//!
//! One pass moves an instance at most one step through its state machine:
//!
//! 1. poll an asynchronous operation if one is in flight
//! 2. finish orphan mitigation if it was started
//! 3. deprovision once the instance is being deleted
//! 4. otherwise resolve class and plan, then provision or update
//!
//! The next step is always persisted in status before the broker is called,
//! so a crash between the write and the call only repeats an idempotent
//! request.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::broker::{
    BrokerClient, BrokerError, DeprovisionRequest, InstancePollRequest, OperationOutcome,
    OperationState, ProvisionRequest, RequestContext, UpdateInstanceRequest,
};
use crate::crd::{
    is_condition_true, CleanupStatus, ClusterObjectReference, ClusterServiceClass,
    ClusterServicePlan, ConditionStatus, InstanceOperation, ProvisionStatus, ServiceInstance,
    ServiceInstancePropertiesState, ServiceInstanceStatus, CONDITION_FAILED,
};
use crate::dispatcher::{Action, ObjectKey};
use crate::error::ErrorClass;
use crate::Error;

use super::parameters::{self, PreparedParameters};
use super::status::{clear_failed, is_ready, set_failed, set_ready, write_instance};
use super::{has_finalizer, orphan, with_finalizer, without_finalizer, Context};

const REASON_NONEXISTENT_CLASS: &str = "ReferencesNonexistentServiceClass";
const REASON_NONEXISTENT_PLAN: &str = "ReferencesNonexistentServicePlan";
const REASON_CLASS_REMOVED: &str = "ServiceClassRemoved";
const REASON_PLAN_REMOVED: &str = "ServicePlanRemoved";
const REASON_PARAMETERS: &str = "ErrorWithParameters";
const REASON_BROKER: &str = "ErrorGettingBrokerClient";
const REASON_PROVISIONING: &str = "Provisioning";
const REASON_PROVISIONED: &str = "ProvisionedSuccessfully";
const REASON_PROVISION_FAILED: &str = "ProvisionCallFailed";
const REASON_PROVISION_ERROR: &str = "ErrorCallingProvision";
const REASON_UPDATING: &str = "UpdatingInstance";
const REASON_UPDATED: &str = "InstanceUpdatedSuccessfully";
const REASON_UPDATE_FAILED: &str = "UpdateInstanceCallFailed";
const REASON_UPDATE_ERROR: &str = "ErrorCallingUpdateInstance";
const REASON_DEPROVISIONING: &str = "Deprovisioning";
const REASON_DEPROVISIONED: &str = "DeprovisionedSuccessfully";
const REASON_DEPROVISION_FAILED: &str = "DeprovisionCallFailed";
const REASON_DEPROVISION_ERROR: &str = "ErrorCallingDeprovision";
const REASON_DEPROVISION_BLOCKED: &str = "DeprovisionBlockedByExistingCredentials";
const REASON_POLL_ERROR: &str = "ErrorPollingLastOperation";
const REASON_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

/// Reconcile the instance behind `key`
#[instrument(skip(ctx), fields(instance = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let namespace = key.require_namespace()?;
    let Some(instance) = ctx.store.get_instance(namespace, &key.name) else {
        debug!("instance no longer exists");
        return Ok(Action::await_change());
    };

    if !instance.is_being_deleted() {
        let mut defaulted = instance.clone();
        if ctx.defaults.apply(&mut defaulted) {
            debug!("writing defaults");
            ctx.store.update_instance(&instance, &defaulted).await?;
            return Ok(Action::await_change());
        }
    }

    InstanceSync {
        ctx,
        namespace: namespace.to_string(),
        instance,
    }
    .run()
    .await
}

/// What a provision or update will send
struct Desired {
    class: ClusterServiceClass,
    plan: ClusterServicePlan,
    params: PreparedParameters,
    properties: ServiceInstancePropertiesState,
}

/// Broker-side identity of an instance
struct BrokerIds {
    broker: String,
    service_id: String,
    plan_id: String,
}

fn reason_for(op: InstanceOperation) -> &'static str {
    match op {
        InstanceOperation::Provision => REASON_PROVISIONING,
        InstanceOperation::Update => REASON_UPDATING,
        InstanceOperation::Deprovision => REASON_DEPROVISIONING,
    }
}

fn verb_for(op: InstanceOperation) -> &'static str {
    match op {
        InstanceOperation::Provision => "provisioned",
        InstanceOperation::Update => "updated",
        InstanceOperation::Deprovision => "deprovisioned",
    }
}

/// Mark `op` as the operation in flight, restarting the budget if it is new
fn begin(status: &mut ServiceInstanceStatus, op: InstanceOperation) {
    if status.current_operation != Some(op) {
        status.operation_start_time = Some(chrono::Utc::now());
        status.operation_attempts = 0;
    }
    status.current_operation = Some(op);
    status.async_op_in_progress = false;
    status.last_operation = None;
}

/// Clear all in-flight operation state
fn finish(status: &mut ServiceInstanceStatus) {
    status.current_operation = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.operation_start_time = None;
    status.operation_attempts = 0;
}

struct InstanceSync<'a> {
    ctx: &'a Context,
    namespace: String,
    instance: ServiceInstance,
}

impl InstanceSync<'_> {
    fn status(&self) -> ServiceInstanceStatus {
        self.instance.status_or_default()
    }

    async fn save(&mut self, status: ServiceInstanceStatus) -> Result<(), Error> {
        self.instance = write_instance(self.ctx.store.as_ref(), &self.instance, status).await?;
        Ok(())
    }

    async fn run(mut self) -> Result<Action, Error> {
        let deleting = self.instance.is_being_deleted();
        if deleting && !has_finalizer(&self.instance) {
            return Ok(Action::await_change());
        }

        let status = self.status();
        if status.async_op_in_progress {
            return self.poll().await;
        }
        if status.orphan_mitigation_in_progress {
            return self.deprovision().await;
        }
        if deleting {
            return self.delete().await;
        }

        if is_condition_true(&status.conditions, CONDITION_FAILED) {
            if status.observed_generation == self.instance.generation() {
                debug!("failed at this generation, waiting for a spec change");
                return Ok(Action::await_change());
            }
            let mut status = status;
            clear_failed(&mut status.conditions);
            self.save(status).await?;
        }

        if let Some(updated) = with_finalizer(&self.instance) {
            self.instance = self.ctx.store.update_instance(&self.instance, &updated).await?;
        }

        let desired = match self.desired().await? {
            Ok(desired) => desired,
            Err(action) => return Ok(action),
        };
        self.provision_or_update(desired).await
    }

    /// Resolve references and parameters. An `Err(action)` means the pass
    /// already recorded why it cannot proceed.
    async fn desired(&mut self) -> Result<Result<Desired, Action>, Error> {
        let (class, plan) = self.resolve_references().await?;

        let spec = &self.instance.spec;
        let params = match parameters::prepare(
            self.ctx.secrets.as_ref(),
            &self.namespace,
            spec.parameters.as_ref(),
            &spec.parameters_from,
        )
        .await
        {
            Ok(params) => params,
            Err(e) if e.class() == ErrorClass::Terminal => {
                let action = self
                    .fail(REASON_PARAMETERS, format!("invalid parameters: {e}"))
                    .await?;
                return Ok(Err(action));
            }
            Err(e) => return Err(e),
        };

        let properties = ServiceInstancePropertiesState {
            cluster_service_plan_external_name: plan.spec.external_name.clone(),
            cluster_service_plan_external_id: plan.spec.external_id.clone(),
            parameters: params.stored(),
            parameter_checksum: params.checksum.clone(),
            user_info: self.instance.spec.user_info.clone(),
        };
        Ok(Ok(Desired {
            class,
            plan,
            params,
            properties,
        }))
    }

    async fn resolve_references(
        &mut self,
    ) -> Result<(ClusterServiceClass, ClusterServicePlan), Error> {
        let class = match self.lookup_class() {
            Ok(class) => class,
            Err(message) => return Err(self.unresolved(REASON_NONEXISTENT_CLASS, message).await),
        };
        let plan = match self.lookup_plan(&class) {
            Ok(plan) => plan,
            Err(message) => return Err(self.unresolved(REASON_NONEXISTENT_PLAN, message).await),
        };

        let class_ref = Some(ClusterObjectReference::new(class.name_any()));
        let plan_ref = Some(ClusterObjectReference::new(plan.name_any()));
        if self.instance.spec.cluster_service_class_ref != class_ref
            || self.instance.spec.cluster_service_plan_ref != plan_ref
        {
            debug!(class = %class.name_any(), plan = %plan.name_any(), "resolved references");
            let mut updated = self.instance.clone();
            updated.spec.cluster_service_class_ref = class_ref;
            updated.spec.cluster_service_plan_ref = plan_ref;
            self.instance = self.ctx.store.update_instance(&self.instance, &updated).await?;
        }
        Ok((class, plan))
    }

    fn lookup_class(&self) -> Result<ClusterServiceClass, String> {
        let spec = &self.instance.spec;
        let store = &self.ctx.store;

        if let Some(name) = &spec.cluster_service_class_name {
            return store
                .get_class(name)
                .ok_or_else(|| format!("references a non-existent ClusterServiceClass {name:?}"));
        }
        if let Some(external) = &spec.cluster_service_class_external_name {
            let mut matches = store
                .list_classes()
                .into_iter()
                .filter(|c| &c.spec.external_name == external);
            let found = matches.next().ok_or_else(|| {
                format!("references a non-existent ClusterServiceClass named {external:?}")
            })?;
            if matches.next().is_some() {
                return Err(format!(
                    "more than one ClusterServiceClass is named {external:?}"
                ));
            }
            return Ok(found);
        }
        match &spec.cluster_service_class_ref {
            Some(r) => store
                .get_class(&r.name)
                .ok_or_else(|| format!("references a non-existent ClusterServiceClass {:?}", r.name)),
            None => Err("does not name a ClusterServiceClass".to_string()),
        }
    }

    fn lookup_plan(&self, class: &ClusterServiceClass) -> Result<ClusterServicePlan, String> {
        let spec = &self.instance.spec;
        let store = &self.ctx.store;
        let class_name = class.name_any();
        let of_class = |p: &ClusterServicePlan| p.spec.cluster_service_class_ref.name == class_name;

        if let Some(name) = &spec.cluster_service_plan_name {
            return store.get_plan(name).filter(|p| of_class(p)).ok_or_else(|| {
                format!("references a non-existent ClusterServicePlan {name:?}")
            });
        }
        if let Some(external) = &spec.cluster_service_plan_external_name {
            return store
                .list_plans()
                .into_iter()
                .find(|p| of_class(p) && &p.spec.external_name == external)
                .ok_or_else(|| {
                    format!(
                        "references a non-existent ClusterServicePlan named {external:?} of class {:?}",
                        class.spec.external_name
                    )
                });
        }
        if let Some(r) = &spec.cluster_service_plan_ref {
            return store.get_plan(&r.name).filter(|p| of_class(p)).ok_or_else(|| {
                format!("references a non-existent ClusterServicePlan {:?}", r.name)
            });
        }

        let mut plans: Vec<_> = store
            .list_plans()
            .into_iter()
            .filter(|p| of_class(p) && !p.is_removed())
            .collect();
        if plans.len() == 1 {
            return Ok(plans.remove(0));
        }
        Err(format!(
            "does not name a plan and ClusterServiceClass {:?} has {} plans",
            class.spec.external_name,
            plans.len()
        ))
    }

    /// Record an unresolved reference and produce the transient error
    async fn unresolved(&mut self, reason: &str, message: String) -> Error {
        let mut status = self.status();
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            reason,
            message.clone(),
        );
        if let Err(e) = self.save(status).await {
            return e;
        }
        Error::reference_not_found(message)
    }

    async fn client(&mut self, broker: &str) -> Result<Arc<dyn BrokerClient>, Error> {
        match self.ctx.broker_client(broker).await {
            Ok(client) => Ok(client),
            Err(e) => {
                let mut status = self.status();
                set_ready(
                    &mut status.conditions,
                    ConditionStatus::Unknown,
                    REASON_BROKER,
                    e.to_string(),
                );
                self.save(status).await?;
                Err(e)
            }
        }
    }

    async fn provision_or_update(&mut self, desired: Desired) -> Result<Action, Error> {
        let status = self.status();
        let confirmed = match (status.provision_status, &status.external_properties) {
            (ProvisionStatus::Provisioned, Some(external)) => external.clone(),
            _ => {
                if desired.class.is_removed() {
                    let message = format!(
                        "ClusterServiceClass {:?} was removed from the broker catalog",
                        desired.class.spec.external_name
                    );
                    return self.refuse(REASON_CLASS_REMOVED, message).await;
                }
                if desired.plan.is_removed() {
                    let message = format!(
                        "ClusterServicePlan {:?} was removed from the broker catalog",
                        desired.plan.spec.external_name
                    );
                    return self.refuse(REASON_PLAN_REMOVED, message).await;
                }
                return self.provision(desired).await;
            }
        };

        let plan_changed = confirmed.cluster_service_plan_external_id
            != desired.properties.cluster_service_plan_external_id;
        let params_changed =
            confirmed.parameter_checksum != desired.properties.parameter_checksum;
        if !plan_changed && !params_changed {
            return self.in_sync(status).await;
        }
        if plan_changed && desired.plan.is_removed() {
            let message = format!(
                "ClusterServicePlan {:?} was removed from the broker catalog",
                desired.plan.spec.external_name
            );
            return self.refuse(REASON_PLAN_REMOVED, message).await;
        }
        if plan_changed && !desired.class.spec.plan_updatable {
            let message = format!(
                "ClusterServiceClass {:?} does not allow plan changes",
                desired.class.spec.external_name
            );
            return self.fail(REASON_UPDATE_FAILED, message).await;
        }
        self.update(desired, confirmed, plan_changed, params_changed)
            .await
    }

    /// The broker already holds what the spec asks for
    async fn in_sync(&mut self, mut status: ServiceInstanceStatus) -> Result<Action, Error> {
        if status.current_operation.is_some() {
            debug!("spec reverted to the confirmed state, dropping pending operation");
            finish(&mut status);
            status.in_progress_properties = None;
        }
        if !is_ready(&status.conditions) {
            set_ready(
                &mut status.conditions,
                ConditionStatus::True,
                REASON_PROVISIONED,
                "The instance was provisioned successfully",
            );
        }
        self.save(status).await?;
        Ok(Action::await_change())
    }

    /// Surface a condition that blocks progress without marking a failure
    async fn refuse(&mut self, reason: &str, message: String) -> Result<Action, Error> {
        warn!(reason, %message, "not provisioning");
        let mut status = self.status();
        set_ready(&mut status.conditions, ConditionStatus::False, reason, message);
        self.save(status).await?;
        Ok(Action::await_change())
    }

    /// Terminal failure for this generation
    async fn fail(&mut self, reason: &str, message: String) -> Result<Action, Error> {
        warn!(reason, %message, "instance operation failed");
        let mut status = self.status();
        finish(&mut status);
        status.in_progress_properties = None;
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            reason,
            message.clone(),
        );
        set_failed(&mut status.conditions, reason, message);
        self.save(status).await?;
        Ok(Action::await_change())
    }

    /// Transient failure: surface it and let the dispatcher back off, unless
    /// the operation has been retried for too long
    async fn retry_later(&mut self, reason: &str, err: Error) -> Result<Action, Error> {
        let mut status = self.status();
        if self.ctx.budget_elapsed(status.operation_start_time) {
            return self
                .fail(
                    REASON_RETRY_TIMEOUT,
                    format!("stopped retrying after the retry budget elapsed: {err}"),
                )
                .await;
        }
        set_ready(
            &mut status.conditions,
            ConditionStatus::Unknown,
            reason,
            err.to_string(),
        );
        self.save(status).await?;
        Err(err)
    }

    async fn provision(&mut self, desired: Desired) -> Result<Action, Error> {
        let client = self
            .client(&desired.class.spec.cluster_service_broker_name)
            .await?;

        let mut status = self.status();
        begin(&mut status, InstanceOperation::Provision);
        status.in_progress_properties = Some(desired.properties);
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_PROVISIONING,
            "The instance is being provisioned",
        );
        self.save(status).await?;

        let request = ProvisionRequest {
            instance_id: self.instance.spec.external_id.clone(),
            service_id: desired.class.spec.external_id.clone(),
            plan_id: desired.plan.spec.external_id.clone(),
            parameters: desired.params.merged,
            context: RequestContext::kubernetes(&self.namespace),
            originating_identity: self.instance.spec.user_info.clone(),
        };
        info!(
            class = %desired.class.spec.external_name,
            plan = %desired.plan.spec.external_name,
            "provisioning instance"
        );
        match client.provision(&request).await {
            Ok(OperationOutcome::Succeeded(result)) => {
                self.succeeded(InstanceOperation::Provision, result.dashboard_url)
                    .await
            }
            Ok(OperationOutcome::Accepted { operation }) => {
                self.accepted(InstanceOperation::Provision, operation).await
            }
            Err(e) => match e.class() {
                ErrorClass::Terminal => {
                    self.fail(REASON_PROVISION_FAILED, format!("provision call failed: {e}"))
                        .await
                }
                ErrorClass::Ambiguous => {
                    self.start_orphan_mitigation(format!("provision outcome unknown: {e}"), false)
                        .await
                }
                _ => self.retry_later(REASON_PROVISION_ERROR, e.into()).await,
            },
        }
    }

    async fn update(
        &mut self,
        desired: Desired,
        confirmed: ServiceInstancePropertiesState,
        plan_changed: bool,
        params_changed: bool,
    ) -> Result<Action, Error> {
        let client = self
            .client(&desired.class.spec.cluster_service_broker_name)
            .await?;

        let mut status = self.status();
        begin(&mut status, InstanceOperation::Update);
        status.in_progress_properties = Some(desired.properties);
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_UPDATING,
            "The instance is being updated",
        );
        self.save(status).await?;

        let request = UpdateInstanceRequest {
            instance_id: self.instance.spec.external_id.clone(),
            service_id: desired.class.spec.external_id.clone(),
            plan_id: plan_changed.then(|| desired.plan.spec.external_id.clone()),
            parameters: params_changed.then_some(desired.params.merged),
            previous_plan_id: Some(confirmed.cluster_service_plan_external_id),
            context: RequestContext::kubernetes(&self.namespace),
            originating_identity: self.instance.spec.user_info.clone(),
        };
        info!(plan_changed, params_changed, "updating instance");
        match client.update_instance(&request).await {
            Ok(OperationOutcome::Succeeded(result)) => {
                self.succeeded(InstanceOperation::Update, result.dashboard_url)
                    .await
            }
            Ok(OperationOutcome::Accepted { operation }) => {
                self.accepted(InstanceOperation::Update, operation).await
            }
            Err(e) if e.class() == ErrorClass::Terminal => {
                self.fail(REASON_UPDATE_FAILED, format!("update call failed: {e}"))
                    .await
            }
            Err(e) => self.retry_later(REASON_UPDATE_ERROR, e.into()).await,
        }
    }

    /// Provision or update confirmed by the broker
    async fn succeeded(
        &mut self,
        op: InstanceOperation,
        dashboard_url: Option<String>,
    ) -> Result<Action, Error> {
        let mut status = self.status();
        status.external_properties = status.in_progress_properties.take();
        status.provision_status = ProvisionStatus::Provisioned;
        status.deprovision_status.advance(CleanupStatus::Required);
        if dashboard_url.is_some() {
            status.dashboard_url = dashboard_url;
        }
        finish(&mut status);
        let reason = match op {
            InstanceOperation::Update => REASON_UPDATED,
            _ => REASON_PROVISIONED,
        };
        set_ready(
            &mut status.conditions,
            ConditionStatus::True,
            reason,
            format!("The instance was {} successfully", verb_for(op)),
        );
        clear_failed(&mut status.conditions);
        info!(operation = %op, "instance operation succeeded");
        self.save(status).await?;
        Ok(Action::await_change())
    }

    /// The broker accepted `op` and will finish it asynchronously
    async fn accepted(
        &mut self,
        op: InstanceOperation,
        operation: Option<String>,
    ) -> Result<Action, Error> {
        let mut status = self.status();
        status.async_op_in_progress = true;
        status.last_operation = operation;
        if op != InstanceOperation::Deprovision {
            status.deprovision_status.advance(CleanupStatus::Required);
        }
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            reason_for(op),
            format!("The instance is being {} asynchronously", verb_for(op)),
        );
        info!(operation = %op, "broker accepted asynchronous operation");
        self.save(status).await?;
        Ok(Action::requeue(self.ctx.config.poll_interval))
    }

    fn broker_ids(
        &self,
        status: &ServiceInstanceStatus,
        prefer_confirmed: bool,
    ) -> Result<BrokerIds, Error> {
        let spec = &self.instance.spec;
        let class_name = spec
            .cluster_service_class_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .ok_or_else(|| Error::invariant("instance has broker state but no resolved class"))?;
        let class = self.ctx.store.get_class(class_name).ok_or_else(|| {
            Error::reference_not_found(format!("ClusterServiceClass {class_name}"))
        })?;

        let (first, second) = if prefer_confirmed {
            (&status.external_properties, &status.in_progress_properties)
        } else {
            (&status.in_progress_properties, &status.external_properties)
        };
        let plan_id = match first.as_ref().or(second.as_ref()) {
            Some(props) => props.cluster_service_plan_external_id.clone(),
            None => {
                let plan_name = spec
                    .cluster_service_plan_ref
                    .as_ref()
                    .map(|r| r.name.as_str())
                    .ok_or_else(|| {
                        Error::invariant("instance has broker state but no resolved plan")
                    })?;
                self.ctx
                    .store
                    .get_plan(plan_name)
                    .map(|p| p.spec.external_id)
                    .ok_or_else(|| {
                        Error::reference_not_found(format!("ClusterServicePlan {plan_name}"))
                    })?
            }
        };

        Ok(BrokerIds {
            broker: class.spec.cluster_service_broker_name,
            service_id: class.spec.external_id,
            plan_id,
        })
    }

    async fn poll(&mut self) -> Result<Action, Error> {
        let status = self.status();
        let Some(op) = status.current_operation else {
            warn!("asynchronous operation flagged without a current operation, clearing");
            let mut status = status;
            status.async_op_in_progress = false;
            status.last_operation = None;
            self.save(status).await?;
            return Ok(Action::requeue(Duration::ZERO));
        };

        let deprovisioning = op == InstanceOperation::Deprovision;
        let ids = self.broker_ids(&status, deprovisioning)?;
        let client = self.client(&ids.broker).await?;
        let request = InstancePollRequest {
            instance_id: self.instance.spec.external_id.clone(),
            service_id: ids.service_id,
            plan_id: ids.plan_id,
            operation: status.last_operation.clone(),
            deprovisioning,
        };

        match client.poll_instance_operation(&request).await {
            Ok(last) => match last.state {
                OperationState::InProgress => self.still_running(op, last.description).await,
                OperationState::Succeeded if deprovisioning => self.deprovisioned().await,
                OperationState::Succeeded => self.succeeded(op, None).await,
                OperationState::Failed => {
                    let message = match last.description {
                        Some(d) => format!("{op} failed: {d}"),
                        None => format!("{op} failed"),
                    };
                    self.async_failed(op, message).await
                }
            },
            Err(e) if e.class() == ErrorClass::Terminal => {
                self.async_failed(op, format!("{op} poll failed: {e}")).await
            }
            Err(e) => {
                if self.ctx.budget_elapsed(status.operation_start_time) {
                    return self.timed_out(op).await;
                }
                let mut status = status;
                set_ready(
                    &mut status.conditions,
                    ConditionStatus::Unknown,
                    REASON_POLL_ERROR,
                    e.to_string(),
                );
                self.save(status).await?;
                Err(e.into())
            }
        }
    }

    async fn still_running(
        &mut self,
        op: InstanceOperation,
        description: Option<String>,
    ) -> Result<Action, Error> {
        let mut status = self.status();
        if self.ctx.budget_elapsed(status.operation_start_time) {
            return self.timed_out(op).await;
        }
        let mut message = format!("The instance is being {} asynchronously", verb_for(op));
        if let Some(description) = description {
            message = format!("{message} ({description})");
        }
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            reason_for(op),
            message,
        );
        self.save(status).await?;
        Ok(Action::requeue(self.ctx.config.poll_interval))
    }

    async fn timed_out(&mut self, op: InstanceOperation) -> Result<Action, Error> {
        let message = format!("{op} did not finish within the retry budget");
        match op {
            InstanceOperation::Provision => self.start_orphan_mitigation(message, true).await,
            InstanceOperation::Update => self.fail(REASON_RETRY_TIMEOUT, message).await,
            InstanceOperation::Deprovision => {
                let status = self.status();
                self.deprovision_exhausted(status, message).await
            }
        }
    }

    async fn async_failed(&mut self, op: InstanceOperation, message: String) -> Result<Action, Error> {
        match op {
            InstanceOperation::Provision => self.fail(REASON_PROVISION_FAILED, message).await,
            InstanceOperation::Update => self.fail(REASON_UPDATE_FAILED, message).await,
            InstanceOperation::Deprovision => {
                self.deprovision_attempt_failed(BrokerError::unavailable(message).into(), true)
                    .await
            }
        }
    }

    /// Persist the switch to a mitigating deprovision. The pass ends in a
    /// retryable error so every mitigation cycle goes through the backoff.
    /// With `give_up` the instance is marked failed for this generation and
    /// is not provisioned again once the orphan is gone.
    async fn start_orphan_mitigation(&mut self, message: String, give_up: bool) -> Result<Action, Error> {
        warn!(%message, give_up, "starting orphan mitigation");
        let mut status = self.status();
        orphan::begin_instance(&mut status, REASON_PROVISION_FAILED, &message);
        if give_up {
            set_failed(&mut status.conditions, REASON_RETRY_TIMEOUT, message.clone());
        }
        self.save(status).await?;
        Err(Error::orphan_mitigation(message))
    }

    async fn delete(&mut self) -> Result<Action, Error> {
        let status = self.status();
        match status.deprovision_status {
            CleanupStatus::NotRequired | CleanupStatus::Succeeded => return self.release().await,
            CleanupStatus::Failed => {
                debug!("deprovision failed earlier, keeping finalizer");
                return Ok(Action::await_change());
            }
            CleanupStatus::Required => {}
        }

        let name = self.instance.name_any();
        let bindings = self
            .ctx
            .store
            .list_bindings(&self.namespace)
            .iter()
            .filter(|b| b.spec.instance_ref.name == name)
            .count();
        if bindings > 0 {
            debug!(bindings, "deprovision waiting for bindings to be deleted");
            let mut status = status;
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_DEPROVISION_BLOCKED,
                format!("All associated ServiceBindings must be removed before this instance can be deleted ({bindings} remaining)"),
            );
            self.save(status).await?;
            return Ok(Action::await_change());
        }

        self.deprovision().await
    }

    async fn deprovision(&mut self) -> Result<Action, Error> {
        let status = self.status();
        let ids = self.broker_ids(&status, true)?;
        let client = self.client(&ids.broker).await?;

        let mut status = status;
        begin(&mut status, InstanceOperation::Deprovision);
        if !status.orphan_mitigation_in_progress {
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_DEPROVISIONING,
                "The instance is being deprovisioned",
            );
        }
        let mitigating = status.orphan_mitigation_in_progress;
        self.save(status).await?;

        let request = DeprovisionRequest {
            instance_id: self.instance.spec.external_id.clone(),
            service_id: ids.service_id,
            plan_id: ids.plan_id,
            originating_identity: self.instance.spec.user_info.clone(),
        };
        info!(mitigating, "deprovisioning instance");
        match client.deprovision(&request).await {
            Ok(OperationOutcome::Succeeded(())) => self.deprovisioned().await,
            Ok(OperationOutcome::Accepted { operation }) => {
                self.accepted(InstanceOperation::Deprovision, operation)
                    .await
            }
            Err(e) if e.class() == ErrorClass::Terminal => {
                let status = self.status();
                self.deprovision_exhausted(status, format!("deprovision call failed: {e}"))
                    .await
            }
            Err(e) => {
                let counted = e.class() == ErrorClass::Ambiguous;
                self.deprovision_attempt_failed(e.into(), counted).await
            }
        }
    }

    /// A deprovision that may be retried. Only `counted` failures, where the
    /// broker may have acted or reported failure, use up attempts; the rest
    /// are bounded by the retry duration alone.
    async fn deprovision_attempt_failed(&mut self, err: Error, counted: bool) -> Result<Action, Error> {
        let mut status = self.status();
        if counted {
            status.operation_attempts += 1;
        }
        status.async_op_in_progress = false;
        status.last_operation = None;
        if self.ctx.attempts_exhausted(status.operation_attempts)
            || self.ctx.budget_elapsed(status.operation_start_time)
        {
            let message = format!(
                "deprovision failed after {} attempts: {err}",
                status.operation_attempts
            );
            return self.deprovision_exhausted(status, message).await;
        }
        set_ready(
            &mut status.conditions,
            ConditionStatus::Unknown,
            REASON_DEPROVISION_ERROR,
            err.to_string(),
        );
        self.save(status).await?;
        Err(err)
    }

    async fn deprovision_exhausted(
        &mut self,
        mut status: ServiceInstanceStatus,
        message: String,
    ) -> Result<Action, Error> {
        warn!(%message, "giving up on deprovision");
        if status.orphan_mitigation_in_progress {
            orphan::finish_instance(&mut status, false, &message);
        } else {
            status.deprovision_status.advance(CleanupStatus::Failed);
            finish(&mut status);
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_DEPROVISION_FAILED,
                message.clone(),
            );
            set_failed(&mut status.conditions, REASON_DEPROVISION_FAILED, message);
        }
        self.save(status).await?;
        Ok(Action::await_change())
    }

    async fn deprovisioned(&mut self) -> Result<Action, Error> {
        let mut status = self.status();
        if status.orphan_mitigation_in_progress {
            info!("orphan mitigation complete");
            orphan::finish_instance(
                &mut status,
                true,
                "The broker confirmed removal after an uncertain provision",
            );
            if !self.instance.is_being_deleted() {
                let gave_up = is_condition_true(&status.conditions, CONDITION_FAILED);
                self.save(status).await?;
                if gave_up {
                    return Ok(Action::await_change());
                }
                return Err(Error::orphan_mitigation(
                    "orphaned instance removed, provision will be retried",
                ));
            }
        }

        status.deprovision_status.advance(CleanupStatus::Succeeded);
        status.provision_status = ProvisionStatus::NotProvisioned;
        status.external_properties = None;
        status.in_progress_properties = None;
        status.dashboard_url = None;
        finish(&mut status);
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_DEPROVISIONED,
            "The instance was deprovisioned successfully",
        );
        info!("instance deprovisioned");
        self.save(status).await?;
        self.release().await
    }

    async fn release(&mut self) -> Result<Action, Error> {
        if let Some(updated) = without_finalizer(&self.instance) {
            debug!("removing finalizer");
            self.ctx.store.update_instance(&self.instance, &updated).await?;
        }
        Ok(Action::await_change())
    }
}
