//! ServiceBinding reconciliation
//!
//! Binding follows the same shape as the instance flow: poll, then finish
//! orphan mitigation, then unbind on deletion, then bind. Credentials returned
//! by the broker are reshaped by the binding's transforms and written to the
//! named Secret before the binding is reported Ready.

use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tracing::{debug, info, instrument, warn};

use crate::broker::{
    BindRequest, BindingPollRequest, BrokerClient, BrokerError, Credentials, GetBindingRequest,
    OperationOutcome, OperationState, RequestContext, UnbindRequest,
};
use crate::crd::{
    is_condition_true, BindingOperation, CleanupStatus, ClusterServiceClass, ClusterServicePlan,
    ConditionStatus, ServiceBinding, ServiceBindingPropertiesState, ServiceBindingStatus,
    ServiceInstance, CONDITION_FAILED,
};
use crate::dispatcher::{Action, ObjectKey};
use crate::error::ErrorClass;
use crate::Error;

use super::status::{clear_failed, is_ready, set_failed, set_ready, write_binding};
use super::{has_finalizer, orphan, parameters, transform, with_finalizer, without_finalizer, Context};

const REASON_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
const REASON_INSTANCE_DELETED: &str = "ReferencesDeletedInstance";
const REASON_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
const REASON_NONBINDABLE: &str = "ErrorNonbindableServiceClass";
const REASON_PARAMETERS: &str = "ErrorWithParameters";
const REASON_BROKER: &str = "ErrorGettingBrokerClient";
const REASON_BINDING: &str = "Binding";
const REASON_BIND_FAILED: &str = "BindCallFailed";
const REASON_BIND_ERROR: &str = "ErrorCallingBind";
const REASON_INJECTED: &str = "InjectedBindResult";
const REASON_INJECTION_FAILED: &str = "ErrorInjectingBindResult";
const REASON_FETCH_ERROR: &str = "ErrorFetchingBindingCredentials";
const REASON_UNBINDING: &str = "Unbinding";
const REASON_UNBOUND: &str = "UnboundSuccessfully";
const REASON_UNBIND_FAILED: &str = "UnbindCallFailed";
const REASON_UNBIND_ERROR: &str = "ErrorCallingUnbind";
const REASON_POLL_ERROR: &str = "ErrorPollingLastOperation";
const REASON_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

/// Reconcile the binding behind `key`
#[instrument(skip(ctx), fields(binding = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let namespace = key.require_namespace()?;
    let Some(binding) = ctx.store.get_binding(namespace, &key.name) else {
        debug!("binding no longer exists");
        return Ok(Action::await_change());
    };

    if !binding.is_being_deleted() {
        let mut defaulted = binding.clone();
        if ctx.defaults.apply(&mut defaulted) {
            debug!("writing defaults");
            ctx.store.update_binding(&binding, &defaulted).await?;
            return Ok(Action::await_change());
        }
    }

    BindingSync {
        ctx,
        namespace: namespace.to_string(),
        binding,
    }
    .run()
    .await
}

/// The instance a binding points at, with its resolved class and plan
struct Target {
    instance: ServiceInstance,
    class: ClusterServiceClass,
    plan: ClusterServicePlan,
}

impl Target {
    /// Plan the broker last confirmed for the instance
    fn plan_id(&self) -> String {
        self.instance
            .status
            .as_ref()
            .and_then(|s| s.external_properties.as_ref())
            .map(|p| p.cluster_service_plan_external_id.clone())
            .unwrap_or_else(|| self.plan.spec.external_id.clone())
    }
}

fn begin(status: &mut ServiceBindingStatus, op: BindingOperation) {
    if status.current_operation != Some(op) {
        status.operation_start_time = Some(chrono::Utc::now());
        status.operation_attempts = 0;
    }
    status.current_operation = Some(op);
    status.async_op_in_progress = false;
    status.last_operation = None;
}

fn finish(status: &mut ServiceBindingStatus) {
    status.current_operation = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.operation_start_time = None;
    status.operation_attempts = 0;
}

struct BindingSync<'a> {
    ctx: &'a Context,
    namespace: String,
    binding: ServiceBinding,
}

impl BindingSync<'_> {
    fn status(&self) -> ServiceBindingStatus {
        self.binding.status_or_default()
    }

    async fn save(&mut self, status: ServiceBindingStatus) -> Result<(), Error> {
        self.binding = write_binding(self.ctx.store.as_ref(), &self.binding, status).await?;
        Ok(())
    }

    async fn run(mut self) -> Result<Action, Error> {
        let deleting = self.binding.is_being_deleted();
        if deleting && !has_finalizer(&self.binding) {
            return Ok(Action::await_change());
        }

        let status = self.status();
        if status.async_op_in_progress {
            return self.poll().await;
        }
        if status.orphan_mitigation_in_progress {
            return self.unbind().await;
        }
        if deleting {
            return self.delete().await;
        }

        if is_condition_true(&status.conditions, CONDITION_FAILED) {
            if status.reconciled_generation == self.binding.generation() {
                return Ok(Action::await_change());
            }
            let mut status = status;
            clear_failed(&mut status.conditions);
            self.save(status).await?;
        }

        if let Some(updated) = with_finalizer(&self.binding) {
            self.binding = self.ctx.store.update_binding(&self.binding, &updated).await?;
        }

        self.bind().await
    }

    fn target_for(&self, instance: ServiceInstance) -> Result<Target, Error> {
        let class_name = instance
            .spec
            .cluster_service_class_ref
            .as_ref()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::reference_not_found("instance has no resolved class"))?;
        let plan_name = instance
            .spec
            .cluster_service_plan_ref
            .as_ref()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::reference_not_found("instance has no resolved plan"))?;
        let class = self.ctx.store.get_class(&class_name).ok_or_else(|| {
            Error::reference_not_found(format!("ClusterServiceClass {class_name}"))
        })?;
        let plan = self.ctx.store.get_plan(&plan_name).ok_or_else(|| {
            Error::reference_not_found(format!("ClusterServicePlan {plan_name}"))
        })?;
        Ok(Target {
            instance,
            class,
            plan,
        })
    }

    fn target(&self) -> Result<Target, Error> {
        let name = &self.binding.spec.instance_ref.name;
        let instance = self
            .ctx
            .store
            .get_instance(&self.namespace, name)
            .ok_or_else(|| {
                Error::reference_not_found(format!("ServiceInstance {}/{name}", self.namespace))
            })?;
        self.target_for(instance)
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

    async fn refuse(&mut self, reason: &str, message: String) -> Result<Action, Error> {
        debug!(reason, %message, "not binding yet");
        let mut status = self.status();
        set_ready(&mut status.conditions, ConditionStatus::False, reason, message);
        self.save(status).await?;
        Ok(Action::await_change())
    }

    async fn fail(&mut self, reason: &str, message: String) -> Result<Action, Error> {
        warn!(reason, %message, "binding operation failed");
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

    async fn bind(&mut self) -> Result<Action, Error> {
        let status = self.status();
        if status.external_properties.is_some() && is_ready(&status.conditions) {
            self.save(status).await?;
            return Ok(Action::await_change());
        }

        let instance_name = self.binding.spec.instance_ref.name.clone();
        let Some(instance) = self.ctx.store.get_instance(&self.namespace, &instance_name) else {
            let message = format!("references a non-existent ServiceInstance {instance_name:?}");
            let mut status = status;
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_NONEXISTENT_INSTANCE,
                message.clone(),
            );
            self.save(status).await?;
            return Err(Error::reference_not_found(message));
        };
        if instance.is_being_deleted() {
            return self
                .refuse(
                    REASON_INSTANCE_DELETED,
                    format!("ServiceInstance {instance_name:?} is being deleted"),
                )
                .await;
        }
        let instance_status = instance.status_or_default();
        if !is_ready(&instance_status.conditions) || instance_status.async_op_in_progress {
            return self
                .refuse(
                    REASON_INSTANCE_NOT_READY,
                    format!("ServiceInstance {instance_name:?} is not ready"),
                )
                .await;
        }

        let target = self.target_for(instance)?;
        if !target.plan.is_bindable(&target.class) {
            let message = format!(
                "ServiceInstance {instance_name:?} uses a non-bindable class/plan {:?}/{:?}",
                target.class.spec.external_name, target.plan.spec.external_name
            );
            return self.fail(REASON_NONBINDABLE, message).await;
        }

        let spec = &self.binding.spec;
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
                return self
                    .fail(REASON_PARAMETERS, format!("invalid parameters: {e}"))
                    .await;
            }
            Err(e) => return Err(e),
        };

        let client = self
            .client(&target.class.spec.cluster_service_broker_name)
            .await?;

        let mut status = self.status();
        begin(&mut status, BindingOperation::Bind);
        status.in_progress_properties = Some(ServiceBindingPropertiesState {
            parameters: params.stored(),
            parameter_checksum: params.checksum.clone(),
            user_info: self.binding.spec.user_info.clone(),
        });
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_BINDING,
            "The binding is being created",
        );
        self.save(status).await?;

        let request = BindRequest {
            binding_id: self.binding.spec.external_id.clone(),
            instance_id: target.instance.spec.external_id.clone(),
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan_id(),
            parameters: params.merged,
            context: RequestContext::kubernetes(&self.namespace),
            originating_identity: self.binding.spec.user_info.clone(),
        };
        info!(instance = %instance_name, "binding");
        match client.bind(&request).await {
            Ok(OperationOutcome::Succeeded(credentials)) => self.inject(credentials).await,
            Ok(OperationOutcome::Accepted { operation }) => {
                self.accepted(BindingOperation::Bind, operation).await
            }
            Err(e) => match e.class() {
                ErrorClass::Terminal => {
                    self.fail(REASON_BIND_FAILED, format!("bind call failed: {e}"))
                        .await
                }
                ErrorClass::Ambiguous => {
                    self.start_orphan_mitigation(
                        REASON_BIND_FAILED,
                        format!("bind outcome unknown: {e}"),
                        false,
                    )
                    .await
                }
                _ => self.retry_later(REASON_BIND_ERROR, e.into()).await,
            },
        }
    }

    /// Write the transformed credentials, then mark the binding Ready
    async fn inject(&mut self, mut credentials: Credentials) -> Result<Action, Error> {
        transform::apply(&mut credentials, &self.binding.spec.secret_transform);
        if let Err(e) = self.write_secret(&credentials).await {
            let give_up = e.class() == ErrorClass::Terminal;
            return self
                .start_orphan_mitigation(
                    REASON_INJECTION_FAILED,
                    format!("could not write credentials: {e}"),
                    give_up,
                )
                .await;
        }

        let mut status = self.status();
        status.external_properties = status.in_progress_properties.take();
        status.unbind_status.advance(CleanupStatus::Required);
        finish(&mut status);
        set_ready(
            &mut status.conditions,
            ConditionStatus::True,
            REASON_INJECTED,
            "Injected bind result",
        );
        clear_failed(&mut status.conditions);
        info!(secret = %self.binding.spec.secret_name, "credentials injected");
        self.save(status).await?;
        Ok(Action::await_change())
    }

    async fn write_secret(&self, credentials: &Credentials) -> Result<(), Error> {
        let data = transform::secret_data(credentials)?;
        let owner = self
            .binding
            .controller_owner_ref(&())
            .ok_or_else(|| Error::invariant("binding has no uid"))?;
        self.ctx
            .secrets
            .put(&self.namespace, &self.binding.spec.secret_name, data, owner)
            .await
    }

    async fn accepted(
        &mut self,
        op: BindingOperation,
        operation: Option<String>,
    ) -> Result<Action, Error> {
        let mut status = self.status();
        status.async_op_in_progress = true;
        status.last_operation = operation;
        let reason = match op {
            BindingOperation::Bind => {
                status.unbind_status.advance(CleanupStatus::Required);
                REASON_BINDING
            }
            BindingOperation::Unbind => REASON_UNBINDING,
        };
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            reason,
            format!("{op} is running asynchronously"),
        );
        self.save(status).await?;
        Ok(Action::requeue(self.ctx.config.poll_interval))
    }

    /// Persist the switch to a mitigating unbind and end the pass with a
    /// retryable error. With `give_up` the binding stays failed once the
    /// orphan is gone.
    async fn start_orphan_mitigation(
        &mut self,
        reason: &str,
        message: String,
        give_up: bool,
    ) -> Result<Action, Error> {
        warn!(%message, give_up, "starting orphan mitigation");
        let mut status = self.status();
        orphan::begin_binding(&mut status, reason, &message);
        if give_up {
            set_failed(&mut status.conditions, reason, message.clone());
        }
        self.save(status).await?;
        Err(Error::orphan_mitigation(message))
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

        let unbinding = op == BindingOperation::Unbind;
        let target = self.target()?;
        let client = self
            .client(&target.class.spec.cluster_service_broker_name)
            .await?;
        let request = BindingPollRequest {
            instance_id: target.instance.spec.external_id.clone(),
            binding_id: self.binding.spec.external_id.clone(),
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan_id(),
            operation: status.last_operation.clone(),
            unbinding,
        };

        match client.poll_binding_operation(&request).await {
            Ok(last) => match last.state {
                OperationState::InProgress => {
                    if self.ctx.budget_elapsed(status.operation_start_time) {
                        return self.timed_out(op).await;
                    }
                    let mut status = status;
                    let mut message = format!("{op} is running asynchronously");
                    if let Some(description) = last.description {
                        message = format!("{message} ({description})");
                    }
                    let reason = if unbinding { REASON_UNBINDING } else { REASON_BINDING };
                    set_ready(&mut status.conditions, ConditionStatus::False, reason, message);
                    self.save(status).await?;
                    Ok(Action::requeue(self.ctx.config.poll_interval))
                }
                OperationState::Succeeded if unbinding => self.unbound().await,
                OperationState::Succeeded => self.fetch_credentials(client, &target).await,
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

    /// Credentials of an asynchronously created binding
    async fn fetch_credentials(
        &mut self,
        client: Arc<dyn BrokerClient>,
        target: &Target,
    ) -> Result<Action, Error> {
        let request = GetBindingRequest {
            instance_id: target.instance.spec.external_id.clone(),
            binding_id: self.binding.spec.external_id.clone(),
        };
        match client.get_binding(&request).await {
            Ok(credentials) => self.inject(credentials).await,
            Err(e) if e.class() == ErrorClass::Transient => {
                let mut status = self.status();
                set_ready(
                    &mut status.conditions,
                    ConditionStatus::Unknown,
                    REASON_FETCH_ERROR,
                    e.to_string(),
                );
                self.save(status).await?;
                Err(e.into())
            }
            Err(e) => {
                self.start_orphan_mitigation(
                    REASON_FETCH_ERROR,
                    format!("could not fetch credentials: {e}"),
                    false,
                )
                .await
            }
        }
    }

    async fn timed_out(&mut self, op: BindingOperation) -> Result<Action, Error> {
        let message = format!("{op} did not finish within the retry budget");
        match op {
            BindingOperation::Bind => {
                self.start_orphan_mitigation(REASON_RETRY_TIMEOUT, message, true)
                    .await
            }
            BindingOperation::Unbind => {
                let status = self.status();
                self.unbind_exhausted(status, message).await
            }
        }
    }

    async fn async_failed(&mut self, op: BindingOperation, message: String) -> Result<Action, Error> {
        match op {
            BindingOperation::Bind => self.fail(REASON_BIND_FAILED, message).await,
            BindingOperation::Unbind => {
                self.unbind_attempt_failed(BrokerError::unavailable(message).into(), true)
                    .await
            }
        }
    }

    async fn delete(&mut self) -> Result<Action, Error> {
        match self.status().unbind_status {
            CleanupStatus::NotRequired | CleanupStatus::Succeeded => self.release().await,
            CleanupStatus::Failed => {
                debug!("unbind failed earlier, keeping finalizer");
                Ok(Action::await_change())
            }
            CleanupStatus::Required => self.unbind().await,
        }
    }

    async fn unbind(&mut self) -> Result<Action, Error> {
        let target = self.target()?;
        let client = self
            .client(&target.class.spec.cluster_service_broker_name)
            .await?;

        let mut status = self.status();
        begin(&mut status, BindingOperation::Unbind);
        let mitigating = status.orphan_mitigation_in_progress;
        if !mitigating {
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_UNBINDING,
                "The binding is being removed",
            );
        }
        self.save(status).await?;

        let request = UnbindRequest {
            binding_id: self.binding.spec.external_id.clone(),
            instance_id: target.instance.spec.external_id.clone(),
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan_id(),
            originating_identity: self.binding.spec.user_info.clone(),
        };
        info!(mitigating, "unbinding");
        match client.unbind(&request).await {
            Ok(OperationOutcome::Succeeded(())) => self.unbound().await,
            Ok(OperationOutcome::Accepted { operation }) => {
                self.accepted(BindingOperation::Unbind, operation).await
            }
            Err(e) if e.class() == ErrorClass::Terminal => {
                let status = self.status();
                self.unbind_exhausted(status, format!("unbind call failed: {e}"))
                    .await
            }
            Err(e) => {
                let counted = e.class() == ErrorClass::Ambiguous;
                self.unbind_attempt_failed(e.into(), counted).await
            }
        }
    }

    /// An unbind that may be retried. Only `counted` failures use up
    /// attempts; the rest are bounded by the retry duration.
    async fn unbind_attempt_failed(&mut self, err: Error, counted: bool) -> Result<Action, Error> {
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
                "unbind failed after {} attempts: {err}",
                status.operation_attempts
            );
            return self.unbind_exhausted(status, message).await;
        }
        set_ready(
            &mut status.conditions,
            ConditionStatus::Unknown,
            REASON_UNBIND_ERROR,
            err.to_string(),
        );
        self.save(status).await?;
        Err(err)
    }

    async fn unbind_exhausted(
        &mut self,
        mut status: ServiceBindingStatus,
        message: String,
    ) -> Result<Action, Error> {
        warn!(%message, "giving up on unbind");
        if status.orphan_mitigation_in_progress {
            orphan::finish_binding(&mut status, false, &message);
        } else {
            status.unbind_status.advance(CleanupStatus::Failed);
            finish(&mut status);
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                REASON_UNBIND_FAILED,
                message.clone(),
            );
            set_failed(&mut status.conditions, REASON_UNBIND_FAILED, message);
        }
        self.save(status).await?;
        Ok(Action::await_change())
    }

    /// The broker removed the binding; drop the Secret and settle status
    async fn unbound(&mut self) -> Result<Action, Error> {
        let uid = self.binding.meta().uid.clone().unwrap_or_default();
        self.ctx
            .secrets
            .delete(&self.namespace, &self.binding.spec.secret_name, &uid)
            .await?;

        let mut status = self.status();
        if status.orphan_mitigation_in_progress {
            info!("orphan mitigation complete");
            orphan::finish_binding(
                &mut status,
                true,
                "The broker confirmed removal after an uncertain bind",
            );
            if !self.binding.is_being_deleted() {
                let gave_up = is_condition_true(&status.conditions, CONDITION_FAILED);
                self.save(status).await?;
                if gave_up {
                    return Ok(Action::await_change());
                }
                return Err(Error::orphan_mitigation(
                    "orphaned binding removed, bind will be retried",
                ));
            }
        }

        status.unbind_status.advance(CleanupStatus::Succeeded);
        status.external_properties = None;
        status.in_progress_properties = None;
        finish(&mut status);
        set_ready(
            &mut status.conditions,
            ConditionStatus::False,
            REASON_UNBOUND,
            "The binding was removed",
        );
        info!("unbound");
        self.save(status).await?;
        self.release().await
    }

    async fn release(&mut self) -> Result<Action, Error> {
        if let Some(updated) = without_finalizer(&self.binding) {
            debug!("removing finalizer");
            self.ctx.store.update_binding(&self.binding, &updated).await?;
        }
        Ok(Action::await_change())
    }
}
