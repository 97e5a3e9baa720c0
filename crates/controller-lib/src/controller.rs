//! Service watch loop
//!
//! kube-runtime's `Controller` delivers Service events, serializes passes per
//! Service and owns requeue scheduling. This module maps reconciliation
//! outcomes and errors onto its `Action`s. The `Controller` only triggers on
//! applied objects, so a second watch feeds `Deleted` events into the
//! deletion path.

use crate::config::NamespaceScope;
use crate::error::ReconcileError;
use crate::health::{components, HealthRegistry};
use crate::models::{app_value, ServiceKey};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state handed to every pass
pub struct ControllerContext {
    pub reconciler: Reconciler,
    pub health: HealthRegistry,
    /// Cancelled on process shutdown; each pass runs under a child token
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    pub fn new(reconciler: Reconciler, health: HealthRegistry, shutdown: CancellationToken) -> Self {
        Self {
            reconciler,
            health,
            shutdown,
        }
    }
}

type ControllerResult =
    Result<(ObjectRef<Service>, Action), controller::Error<ReconcileError, watcher::Error>>;

/// Watch Services and reconcile them until `ctx.shutdown` is cancelled
pub async fn run_controller(client: Client, ctx: Arc<ControllerContext>) {
    let services: Api<Service> = match &ctx.reconciler.config().service_namespaces {
        NamespaceScope::Only(names) if names.len() == 1 => {
            Api::namespaced(client, &names[0])
        }
        _ => Api::all(client),
    };

    ctx.health.set_ready(true).await;
    info!("Starting Service controller");

    let deletions = watch_deletions(services.clone(), ctx.clone());

    let shutdown = ctx.shutdown.clone();
    let reconciles = Controller::new(services, watcher::Config::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile_service, error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move { handle_result(&ctx, result).await }
        });

    futures::future::join(reconciles, deletions).await;

    ctx.health.set_ready(false).await;
    if !ctx.shutdown.is_cancelled() {
        ctx.health
            .set_unhealthy(components::SERVICE_WATCHER, "Service watch ended")
            .await;
    }
    info!("Service controller stopped");
}

/// Feed Service deletions into the deletion path until shutdown
async fn watch_deletions(services: Api<Service>, ctx: Arc<ControllerContext>) {
    let shutdown = ctx.shutdown.clone();
    watcher(services, watcher::Config::default())
        .default_backoff()
        .take_until(async move { shutdown.cancelled().await })
        .for_each(|event| {
            let ctx = ctx.clone();
            async move {
                match event {
                    Ok(event) => {
                        handle_watch_event(&ctx, event).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "Service deletion watch error");
                        ctx.health
                            .set_degraded(components::SERVICE_WATCHER, err.to_string())
                            .await;
                    }
                }
            }
        })
        .await;
}

/// Remove the monitors of a deleted Service; other events are ignored
///
/// The last observed `app` label names the monitor when none carries the
/// owner annotation.
async fn handle_watch_event(
    ctx: &ControllerContext,
    event: watcher::Event<Service>,
) -> Option<ReconcileOutcome> {
    let watcher::Event::Deleted(service) = event else {
        return None;
    };
    let key = ServiceKey::from_service(&service)?;
    let hint = app_value(&service);
    let cancel = ctx.shutdown.child_token();

    match ctx.reconciler.reconcile_deleted(&key, Some(&hint), &cancel).await {
        Ok(outcome) => {
            info!(service = %key, outcome = outcome.label(), "Handled Service deletion");
            Some(outcome)
        }
        Err(err) => {
            warn!(service = %key, error = %err, "Failed to remove ServiceMonitor of deleted Service");
            ctx.health
                .set_degraded(components::OBJECT_STORE, err.to_string())
                .await;
            None
        }
    }
}

async fn reconcile_service(
    service: Arc<Service>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let cancel = ctx.shutdown.child_token();
    let outcome = ctx.reconciler.reconcile_observed(&service, &cancel).await?;
    Ok(action_for(outcome.requeue_after(ctx.reconciler.config())))
}

fn error_policy(service: Arc<Service>, err: &ReconcileError, _ctx: Arc<ControllerContext>) -> Action {
    let retry = err.retry_after();
    warn!(
        service = ?ServiceKey::from_service(&service),
        kind = err.kind(),
        error = %err,
        retry_after = ?retry,
        "Reconciliation failed"
    );
    action_for(retry)
}

fn action_for(requeue: Option<Duration>) -> Action {
    match requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

async fn handle_result(ctx: &ControllerContext, result: ControllerResult) {
    match result {
        Ok((service, action)) => {
            debug!(service = %service, action = ?action, "Reconciled");
            ctx.health.set_healthy(components::OBJECT_STORE).await;
            ctx.health.set_healthy(components::SERVICE_WATCHER).await;
        }
        Err(controller::Error::ObjectNotFound(service)) => {
            let Some(namespace) = service.namespace.clone() else {
                return;
            };
            let key = ServiceKey::new(namespace, service.name.clone());
            let cancel = ctx.shutdown.child_token();
            match ctx.reconciler.reconcile_deleted(&key, None, &cancel).await {
                Ok(outcome) => debug!(service = %key, outcome = outcome.label(), "Handled Service removal"),
                Err(err) => {
                    warn!(service = %key, error = %err, "Failed to remove ServiceMonitor of deleted Service");
                    ctx.health
                        .set_degraded(components::OBJECT_STORE, err.to_string())
                        .await;
                }
            }
        }
        Err(controller::Error::ReconcilerFailed(err, _)) => match err {
            ReconcileError::Store(_) | ReconcileError::Conflict(_) => {
                ctx.health
                    .set_degraded(components::OBJECT_STORE, err.to_string())
                    .await;
            }
            ReconcileError::DeadlineExceeded(_) => {
                ctx.health
                    .set_degraded(components::PROBER, err.to_string())
                    .await;
            }
            _ => {}
        },
        Err(err) => {
            error!(error = %err, "Service watch error");
            ctx.health
                .set_degraded(components::SERVICE_WATCHER, err.to_string())
                .await;
        }
    }
}
