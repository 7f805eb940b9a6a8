//! ClusterServiceBroker reconciliation: catalog relist
//!
//! A relist fetches the broker catalog and mirrors it into ClusterServiceClass
//! and ClusterServicePlan objects named by their broker-assigned IDs. Entries
//! that disappear from the catalog are flagged as removed rather than deleted
//! so existing instances keep resolving; they are garbage-collected on a
//! later relist once nothing references them.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Catalog, CatalogPlan, CatalogService};
use crate::config::ControllerConfig;
use crate::crd::{
    ClusterObjectReference, ClusterServiceBroker, ClusterServiceBrokerStatus, ClusterServiceClass,
    ClusterServiceClassSpec, ClusterServiceClassStatus, ClusterServicePlan, ClusterServicePlanSpec,
    ClusterServicePlanStatus, ConditionStatus, RelistBehavior, DEFAULT_RELIST_DURATION,
};
use crate::dispatcher::{Action, ObjectKey};
use crate::store::CatalogStore;
use crate::Error;

use super::status::{is_ready, set_ready, write_broker};
use super::{has_finalizer, with_finalizer, without_finalizer, Context};

const REASON_FETCHED: &str = "FetchedCatalog";
const REASON_FETCH_ERROR: &str = "ErrorFetchingCatalog";
const REASON_SYNC_ERROR: &str = "ErrorSyncingCatalog";

/// Reconcile the broker behind `key`
#[instrument(skip(ctx), fields(broker = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let Some(mut broker) = ctx.store.get_broker(&key.name) else {
        debug!("broker no longer exists");
        return Ok(Action::await_change());
    };

    if broker.metadata.deletion_timestamp.is_some() {
        return delete(ctx, broker).await;
    }

    let mut defaulted = broker.clone();
    if ctx.defaults.apply(&mut defaulted) {
        debug!("writing defaults");
        ctx.store.update_broker(&broker, &defaulted).await?;
        return Ok(Action::await_change());
    }

    if let Some(updated) = with_finalizer(&broker) {
        broker = ctx.store.update_broker(&broker, &updated).await?;
    }

    let now = Utc::now();
    if !relist_due(&broker, &ctx.config, now) {
        debug!("catalog is current");
        return Ok(next_relist(&broker, &ctx.config, now));
    }
    relist(ctx, broker).await
}

fn generation(broker: &ClusterServiceBroker) -> i64 {
    broker.metadata.generation.unwrap_or(0)
}

/// Effective relist interval, never shorter than the resync period
fn relist_interval(broker: &ClusterServiceBroker, config: &ControllerConfig) -> Duration {
    broker
        .spec
        .common
        .relist_duration
        .unwrap_or(DEFAULT_RELIST_DURATION)
        .max(config.resync_period)
}

/// True when the catalog should be fetched now
pub fn relist_due(broker: &ClusterServiceBroker, config: &ControllerConfig, now: DateTime<Utc>) -> bool {
    let Some(status) = broker.status.as_ref().map(|s| s.common()) else {
        return true;
    };
    if status.reconciled_generation != generation(broker) || !is_ready(&status.conditions) {
        return true;
    }
    let spec = &broker.spec.common;
    match spec.relist_behavior {
        RelistBehavior::Manual => spec.relist_requests != status.observed_relist_requests,
        RelistBehavior::Duration => match status.last_catalog_retrieval_time {
            None => true,
            Some(last) => now >= last + relist_interval(broker, config),
        },
    }
}

fn next_relist(broker: &ClusterServiceBroker, config: &ControllerConfig, now: DateTime<Utc>) -> Action {
    if broker.spec.common.relist_behavior == RelistBehavior::Manual {
        return Action::await_change();
    }
    let interval = relist_interval(broker, config);
    let last = broker
        .status
        .as_ref()
        .and_then(|s| s.common.last_catalog_retrieval_time)
        .unwrap_or(now);
    let remaining = (last + interval)
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Action::requeue(remaining)
}

async fn relist(ctx: &Context, broker: ClusterServiceBroker) -> Result<Action, Error> {
    let name = broker.name_any();
    let catalog = match ctx.broker_client(&name).await {
        Ok(client) => client.get_catalog().await.map_err(Error::from),
        Err(e) => Err(e),
    };
    let catalog = match catalog {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(error = %e, "catalog fetch failed");
            record_failure(ctx, &broker, REASON_FETCH_ERROR, format!("Error fetching catalog: {e}"))
                .await?;
            return Err(e);
        }
    };

    if let Err(message) = validate(&catalog) {
        warn!(%message, "broker returned an invalid catalog");
        record_failure(ctx, &broker, REASON_SYNC_ERROR, format!("Error syncing catalog: {message}"))
            .await?;
        return Err(Error::validation(message));
    }

    if let Err(e) = sync_catalog(ctx.store.as_ref(), &name, &catalog).await {
        record_failure(ctx, &broker, REASON_SYNC_ERROR, format!("Error syncing catalog: {e}"))
            .await?;
        return Err(e);
    }

    let now = Utc::now();
    let mut status = broker.status.clone().unwrap_or_default();
    let common = status.common_mut();
    set_ready(
        &mut common.conditions,
        ConditionStatus::True,
        REASON_FETCHED,
        "Successfully fetched catalog entries from broker",
    );
    common.last_catalog_retrieval_time = Some(now);
    common.reconciled_generation = generation(&broker);
    common.observed_relist_requests = broker.spec.common.relist_requests;
    common.operation_start_time = None;
    let broker = write_broker(ctx.store.as_ref(), &broker, status).await?;
    info!(services = catalog.services.len(), "catalog relisted");

    Ok(next_relist(&broker, &ctx.config, now))
}

async fn record_failure(
    ctx: &Context,
    broker: &ClusterServiceBroker,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let mut status: ClusterServiceBrokerStatus = broker.status.clone().unwrap_or_default();
    let common = status.common_mut();
    set_ready(
        &mut common.conditions,
        ConditionStatus::False,
        reason,
        message,
    );
    // Ready=False keeps the relist due, so the attempt is recorded like any other
    common.reconciled_generation = generation(broker);
    write_broker(ctx.store.as_ref(), broker, status).await?;
    Ok(())
}

/// Reject catalogs whose identities cannot be mirrored unambiguously
pub fn validate(catalog: &Catalog) -> Result<(), String> {
    let mut services = BTreeSet::new();
    let mut plans = BTreeSet::new();
    for service in &catalog.services {
        if service.id.is_empty() || service.name.is_empty() {
            return Err(format!(
                "service {:?} must have a non-empty id and name",
                service.name
            ));
        }
        if !services.insert(service.id.as_str()) {
            return Err(format!("duplicate service id {:?}", service.id));
        }
        for plan in &service.plans {
            if plan.id.is_empty() || plan.name.is_empty() {
                return Err(format!(
                    "plan {:?} of service {:?} must have a non-empty id and name",
                    plan.name, service.name
                ));
            }
            if !plans.insert(plan.id.as_str()) {
                return Err(format!("duplicate plan id {:?}", plan.id));
            }
        }
    }
    Ok(())
}

fn class_spec(broker: &str, service: &CatalogService) -> ClusterServiceClassSpec {
    ClusterServiceClassSpec {
        cluster_service_broker_name: broker.to_string(),
        external_name: service.name.clone(),
        external_id: service.id.clone(),
        description: service.description.clone(),
        bindable: service.bindable,
        binding_retrievable: service.bindings_retrievable,
        plan_updatable: service.plan_updateable,
        external_metadata: service.metadata.clone(),
        tags: service.tags.clone(),
        requires: service.requires.clone(),
    }
}

fn plan_spec(broker: &str, service: &CatalogService, plan: &CatalogPlan) -> ClusterServicePlanSpec {
    ClusterServicePlanSpec {
        cluster_service_broker_name: broker.to_string(),
        cluster_service_class_ref: ClusterObjectReference::new(service.id.clone()),
        external_name: plan.name.clone(),
        external_id: plan.id.clone(),
        description: plan.description.clone(),
        bindable: plan.bindable,
        free: plan.free.unwrap_or(true),
        external_metadata: plan.metadata.clone(),
        instance_create_parameter_schema: plan.schema("/service_instance/create/parameters"),
        instance_update_parameter_schema: plan.schema("/service_instance/update/parameters"),
        service_binding_create_parameter_schema: plan.schema("/service_binding/create/parameters"),
    }
}

async fn sync_catalog(store: &dyn CatalogStore, broker: &str, catalog: &Catalog) -> Result<(), Error> {
    let mut listed_classes = BTreeSet::new();
    let mut listed_plans = BTreeSet::new();

    for service in &catalog.services {
        sync_class(store, broker, class_spec(broker, service)).await?;
        listed_classes.insert(service.id.clone());
        for plan in &service.plans {
            sync_plan(store, broker, plan_spec(broker, service, plan)).await?;
            listed_plans.insert(plan.id.clone());
        }
    }

    let instances = store.list_instances();
    for plan in store.list_plans() {
        let name = plan.name_any();
        if plan.spec.cluster_service_broker_name != broker || listed_plans.contains(&name) {
            continue;
        }
        if !plan.is_removed() {
            info!(plan = %name, "plan no longer in catalog, marking removed");
            let mut updated = plan.clone();
            updated.status = Some(ClusterServicePlanStatus {
                removed_from_broker_catalog: true,
            });
            store.update_plan_status(&plan, &updated).await?;
            continue;
        }
        let referenced = instances.iter().any(|i| {
            i.spec
                .cluster_service_plan_ref
                .as_ref()
                .is_some_and(|r| r.name == name)
        });
        if !referenced {
            info!(plan = %name, "deleting removed plan");
            store.delete_plan(&name).await?;
        }
    }

    for class in store.list_classes() {
        let name = class.name_any();
        if class.spec.cluster_service_broker_name != broker || listed_classes.contains(&name) {
            continue;
        }
        if !class.is_removed() {
            info!(class = %name, "class no longer in catalog, marking removed");
            let mut updated = class.clone();
            updated.status = Some(ClusterServiceClassStatus {
                removed_from_broker_catalog: true,
            });
            store.update_class_status(&class, &updated).await?;
            continue;
        }
        let referenced = instances.iter().any(|i| {
            i.spec
                .cluster_service_class_ref
                .as_ref()
                .is_some_and(|r| r.name == name)
        });
        if !referenced {
            info!(class = %name, "deleting removed class");
            store.delete_class(&name).await?;
        }
    }
    Ok(())
}

async fn sync_class(
    store: &dyn CatalogStore,
    broker: &str,
    spec: ClusterServiceClassSpec,
) -> Result<(), Error> {
    let name = spec.external_id.clone();
    let Some(existing) = store.get_class(&name) else {
        debug!(class = %name, "creating class");
        store.create_class(&ClusterServiceClass::new(&name, spec)).await?;
        return Ok(());
    };
    if existing.spec.cluster_service_broker_name != broker {
        warn!(
            class = %name,
            owner = %existing.spec.cluster_service_broker_name,
            "class name is owned by another broker, skipping"
        );
        return Ok(());
    }

    let mut current = existing.clone();
    if existing.spec != spec {
        debug!(class = %name, "updating class");
        let mut updated = existing.clone();
        updated.spec = spec;
        current = store.update_class(&existing, &updated).await?;
    }
    if current.is_removed() {
        info!(class = %name, "class is back in the catalog");
        let mut updated = current.clone();
        updated.status = Some(ClusterServiceClassStatus::default());
        store.update_class_status(&current, &updated).await?;
    }
    Ok(())
}

async fn sync_plan(
    store: &dyn CatalogStore,
    broker: &str,
    spec: ClusterServicePlanSpec,
) -> Result<(), Error> {
    let name = spec.external_id.clone();
    let Some(existing) = store.get_plan(&name) else {
        debug!(plan = %name, "creating plan");
        store.create_plan(&ClusterServicePlan::new(&name, spec)).await?;
        return Ok(());
    };
    if existing.spec.cluster_service_broker_name != broker {
        warn!(
            plan = %name,
            owner = %existing.spec.cluster_service_broker_name,
            "plan name is owned by another broker, skipping"
        );
        return Ok(());
    }

    let mut current = existing.clone();
    if existing.spec != spec {
        debug!(plan = %name, "updating plan");
        let mut updated = existing.clone();
        updated.spec = spec;
        current = store.update_plan(&existing, &updated).await?;
    }
    if current.is_removed() {
        info!(plan = %name, "plan is back in the catalog");
        let mut updated = current.clone();
        updated.status = Some(ClusterServicePlanStatus::default());
        store.update_plan_status(&current, &updated).await?;
    }
    Ok(())
}

/// Remove everything the broker owns, then let the broker go
async fn delete(ctx: &Context, broker: ClusterServiceBroker) -> Result<Action, Error> {
    if !has_finalizer(&broker) {
        return Ok(Action::await_change());
    }
    let name = broker.name_any();

    for plan in ctx.store.list_plans() {
        if plan.spec.cluster_service_broker_name == name {
            ctx.store.delete_plan(&plan.name_any()).await?;
        }
    }
    for class in ctx.store.list_classes() {
        if class.spec.cluster_service_broker_name == name {
            ctx.store.delete_class(&class.name_any()).await?;
        }
    }

    if let Some(updated) = without_finalizer(&broker) {
        info!("catalog removed, releasing broker");
        ctx.store.update_broker(&broker, &updated).await?;
    }
    Ok(Action::await_change())
}
