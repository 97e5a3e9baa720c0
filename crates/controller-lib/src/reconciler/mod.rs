//! Reconciliation engine
//!
//! One pass per Service: fetch, normalize, probe, discover, diff, write.
//! Nothing is cached between passes; every pass reads the Service and lists
//! the ServiceMonitors again, so repeated or reordered passes converge on the
//! same state.

mod diff;

#[cfg(test)]
mod tests;

pub use diff::MonitorDiff;

use crate::builder::{build_desired, DesiredMonitor};
use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, StoreError};
use crate::models::{app_value, MonitorKey, ServiceKey, ServiceMonitor, OWNER_ANNOTATION};
use crate::normalizer::{labels_with_discovery, normalize_ports, service_patches, ServicePatch};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::probe::{EndpointProber, ServiceHealth};
use crate::selector;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// What a pass decided to do, before any write
#[derive(Debug, Clone)]
pub enum Decision {
    /// No responsible monitor exists
    Create { desired: DesiredMonitor },
    /// A responsible monitor exists with differing owned fields
    Update {
        desired: DesiredMonitor,
        live: ServiceMonitor,
        diff: MonitorDiff,
    },
    Unchanged {
        desired: DesiredMonitor,
        live: ServiceMonitor,
    },
    /// No port answered with 200; monitors are left as they are
    SkipUnhealthy { health: ServiceHealth },
    /// The Service is gone; these monitors are deleted
    Delete { monitors: Vec<MonitorKey> },
    /// The Service's namespace is not watched
    OutOfScope,
}

/// Dry-run result of a pass
#[derive(Debug, Clone)]
pub struct Plan {
    pub service: ServiceKey,
    /// Best-effort Service patches issued before probing
    pub service_patches: Vec<ServicePatch>,
    pub decision: Decision,
}

/// How a completed pass ended
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Created { monitor: MonitorKey },
    Updated {
        monitor: MonitorKey,
        fields: Vec<&'static str>,
    },
    Unchanged { monitor: MonitorKey },
    /// Not an error: the pass succeeded without writing a monitor
    Unhealthy { probed_ports: usize },
    Deleted { monitors: Vec<MonitorKey> },
    Skipped,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created { .. } => "created",
            ReconcileOutcome::Updated { .. } => "updated",
            ReconcileOutcome::Unchanged { .. } => "unchanged",
            ReconcileOutcome::Unhealthy { .. } => "unhealthy",
            ReconcileOutcome::Deleted { .. } => "deleted",
            ReconcileOutcome::Skipped => "skipped",
        }
    }

    /// When to run the pass again without a change event; `None` means done
    pub fn requeue_after(&self, config: &ReconcileConfig) -> Option<Duration> {
        match self {
            ReconcileOutcome::Unhealthy { .. } => Some(config.unhealthy_recheck),
            _ => None,
        }
    }
}

/// Race a store call against cancellation
async fn guarded<T, F>(cancel: &CancellationToken, call: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        result = call => result.map_err(ReconcileError::from),
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    prober: EndpointProber,
    config: Arc<ReconcileConfig>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prober: EndpointProber,
        config: Arc<ReconcileConfig>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            prober,
            config,
            metrics: ControllerMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one pass for `key`
    pub async fn reconcile(
        &self,
        key: &ServiceKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.instrumented(self.run_pass(key, None, cancel)).await
    }

    /// Run one pass for a Service seen by the watcher
    ///
    /// The observed `app` label names the monitor to delete should the
    /// Service have disappeared in the meantime.
    pub async fn reconcile_observed(
        &self,
        observed: &Service,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let key = ServiceKey::from_service(observed).ok_or_else(|| {
            ReconcileError::configuration(format!(
                "service {} has no namespace",
                observed.name_any()
            ))
        })?;
        let hint = app_value(observed);
        self.instrumented(self.run_pass(&key, Some(&hint), cancel))
            .await
    }

    /// Remove the monitors of a Service that no longer exists
    ///
    /// Monitors annotated as created for `key` are deleted; when there are
    /// none, the derived identity (`app_hint`, else the Service name) is.
    /// Deleting an absent monitor succeeds.
    pub async fn reconcile_deleted(
        &self,
        key: &ServiceKey,
        app_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if !self.config.watches(&key.namespace) {
            return Ok(ReconcileOutcome::Skipped);
        }
        self.instrumented(self.delete_monitors(key, app_hint, cancel))
            .await
    }

    /// Compute what a pass would do without writing anything
    pub async fn plan(
        &self,
        key: &ServiceKey,
        cancel: &CancellationToken,
    ) -> Result<Plan, ReconcileError> {
        if !self.config.watches(&key.namespace) {
            return Ok(Plan {
                service: key.clone(),
                service_patches: Vec::new(),
                decision: Decision::OutOfScope,
            });
        }

        let service = guarded(cancel, self.store.get_service(&key.namespace, &key.name)).await?;
        let Some(service) = service else {
            let monitors = self.deletion_targets(key, None, cancel).await?;
            return Ok(Plan {
                service: key.clone(),
                service_patches: Vec::new(),
                decision: Decision::Delete { monitors },
            });
        };

        let normalized = normalize_ports(&service);
        let patches = service_patches(&service, &normalized);
        let decision = self.decide(key, &service, cancel).await?;
        Ok(Plan {
            service: key.clone(),
            service_patches: patches,
            decision,
        })
    }

    async fn instrumented<F>(&self, pass: F) -> Result<ReconcileOutcome, ReconcileError>
    where
        F: Future<Output = Result<ReconcileOutcome, ReconcileError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.pass_timeout, pass).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::DeadlineExceeded(self.config.pass_timeout)),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                self.metrics.inc_reconciliation(outcome.label());
                self.metrics.observe_reconcile_duration("ok", elapsed);
            }
            Err(err) => {
                self.metrics.inc_reconcile_error(err.kind());
                self.metrics.observe_reconcile_duration("error", elapsed);
            }
        }
        result
    }

    #[instrument(skip(self, key, cancel), fields(service = %key))]
    async fn run_pass(
        &self,
        key: &ServiceKey,
        app_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if !self.config.watches(&key.namespace) {
            debug!("Namespace not watched, skipping");
            return Ok(ReconcileOutcome::Skipped);
        }

        let service = guarded(cancel, self.store.get_service(&key.namespace, &key.name)).await?;
        let Some(service) = service else {
            info!("Service not found, removing its ServiceMonitor");
            return self.delete_monitors(key, app_hint, cancel).await;
        };

        self.apply_service_patches(key, &service, cancel).await?;

        match self.decide(key, &service, cancel).await? {
            Decision::Create { desired } => self.create(&desired, cancel).await,
            Decision::Update {
                desired,
                live,
                diff,
            } => self.update(&desired, live, diff, cancel).await,
            Decision::Unchanged { live, .. } => {
                let monitor = monitor_key(&live);
                self.logger
                    .log_monitor_unchanged(&key.to_string(), &monitor.to_string());
                Ok(ReconcileOutcome::Unchanged { monitor })
            }
            Decision::SkipUnhealthy { health } => {
                self.logger
                    .log_endpoint_unhealthy(&key.to_string(), health.ports.len());
                Ok(ReconcileOutcome::Unhealthy {
                    probed_ports: health.ports.len(),
                })
            }
            Decision::Delete { .. } | Decision::OutOfScope => Ok(ReconcileOutcome::Skipped),
        }
    }

    /// Name unnamed ports and add the discovery label; failures are logged only
    async fn apply_service_patches(
        &self,
        key: &ServiceKey,
        service: &Service,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let normalized = normalize_ports(service);
        for patch in service_patches(service, &normalized) {
            self.metrics.inc_mutation("patch_service");
            let call = self
                .store
                .patch_service(&key.namespace, &key.name, &patch.body);
            match guarded(cancel, call).await {
                Ok(()) => debug!(patch = patch.kind.as_str(), "Patched Service"),
                Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
                Err(err) => self.logger.log_service_patch_failed(
                    &key.to_string(),
                    patch.kind.as_str(),
                    &err.to_string(),
                ),
            }
        }
        Ok(())
    }

    /// Probe, discover and diff; read-only
    async fn decide(
        &self,
        key: &ServiceKey,
        service: &Service,
        cancel: &CancellationToken,
    ) -> Result<Decision, ReconcileError> {
        let normalized = normalize_ports(service);

        let health = self.prober.probe_service(service, cancel).await?;
        if !health.is_healthy() {
            return Ok(Decision::SkipUnhealthy { health });
        }

        let desired = build_desired(service, key, &normalized, &self.config);
        let snapshot = self.list_snapshot(cancel).await?;
        let labels = labels_with_discovery(service);

        let live = discover(&snapshot, &labels, &normalized.names(), &desired.key).cloned();
        Ok(match live {
            None => Decision::Create { desired },
            Some(live) => {
                let diff = MonitorDiff::compute(&desired, &live);
                if diff.is_empty() {
                    Decision::Unchanged { desired, live }
                } else {
                    Decision::Update {
                        desired,
                        live,
                        diff,
                    }
                }
            }
        })
    }

    /// Every ServiceMonitor in the monitor namespace, read once per pass
    async fn list_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServiceMonitor>, ReconcileError> {
        let namespace = &self.config.monitor_namespace;
        match guarded(cancel, self.store.list_monitors(namespace)).await {
            Err(ReconcileError::Store(StoreError::NotFound(msg))) => Err(
                ReconcileError::configuration(format!(
                    "ServiceMonitor resource is not served in namespace {}: {}",
                    namespace, msg
                )),
            ),
            other => other,
        }
    }

    async fn create(
        &self,
        desired: &DesiredMonitor,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match self.create_once(desired, cancel).await {
            Err(ReconcileError::Store(StoreError::AlreadyExists(_))) => {
                debug!(monitor = %desired.key, "ServiceMonitor appeared concurrently, re-reading");
                match self.fetch(&desired.key, cancel).await? {
                    Some(live) => {
                        let diff = MonitorDiff::compute(desired, &live);
                        self.update(desired, live, diff, cancel).await
                    }
                    None => Err(ReconcileError::Conflict(desired.key.to_string())),
                }
            }
            other => other,
        }
    }

    async fn create_once(
        &self,
        desired: &DesiredMonitor,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.metrics.inc_mutation("create");
        guarded(cancel, self.store.create_monitor(&desired.to_resource())).await?;
        self.logger.log_monitor_created(
            &desired.owner.to_string(),
            &desired.key.to_string(),
            desired.port(),
            desired.interval(),
        );
        Ok(ReconcileOutcome::Created {
            monitor: desired.key.clone(),
        })
    }

    /// Write the differing fields, re-reading and retrying once on conflict
    async fn update(
        &self,
        desired: &DesiredMonitor,
        live: ServiceMonitor,
        diff: MonitorDiff,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let monitor = monitor_key(&live);
        match self.update_once(desired, &live, diff, cancel).await {
            Err(ReconcileError::Store(StoreError::Conflict(_))) => {}
            other => return other,
        }

        debug!(monitor = %monitor, "Update conflicted, re-reading ServiceMonitor");
        let Some(fresh) = self.fetch(&monitor, cancel).await? else {
            return self.create_once(desired, cancel).await;
        };
        let diff = MonitorDiff::compute(desired, &fresh);
        match self.update_once(desired, &fresh, diff, cancel).await {
            Err(ReconcileError::Store(StoreError::Conflict(_))) => {
                Err(ReconcileError::Conflict(monitor.to_string()))
            }
            other => other,
        }
    }

    async fn update_once(
        &self,
        desired: &DesiredMonitor,
        live: &ServiceMonitor,
        diff: MonitorDiff,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let monitor = monitor_key(live);
        if diff.is_empty() {
            self.logger
                .log_monitor_unchanged(&desired.owner.to_string(), &monitor.to_string());
            return Ok(ReconcileOutcome::Unchanged { monitor });
        }

        self.metrics.inc_mutation("update");
        guarded(cancel, self.store.update_monitor(&diff.apply(desired, live))).await?;
        let fields = diff.fields();
        self.logger
            .log_monitor_updated(&desired.owner.to_string(), &monitor.to_string(), &fields);
        Ok(ReconcileOutcome::Updated { monitor, fields })
    }

    async fn fetch(
        &self,
        key: &MonitorKey,
        cancel: &CancellationToken,
    ) -> Result<Option<ServiceMonitor>, ReconcileError> {
        guarded(cancel, self.store.get_monitor(&key.namespace, &key.name)).await
    }

    async fn deletion_targets(
        &self,
        key: &ServiceKey,
        app_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MonitorKey>, ReconcileError> {
        let owner = key.owner_ref();
        let owned: Vec<MonitorKey> = self
            .list_snapshot(cancel)
            .await?
            .iter()
            .filter(|m| m.annotations().get(OWNER_ANNOTATION) == Some(&owner))
            .map(monitor_key)
            .collect();

        if !owned.is_empty() {
            return Ok(owned);
        }
        Ok(vec![MonitorKey {
            namespace: self.config.monitor_namespace.clone(),
            name: app_hint.unwrap_or(&key.name).to_string(),
        }])
    }

    async fn delete_monitors(
        &self,
        key: &ServiceKey,
        app_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let monitors = self.deletion_targets(key, app_hint, cancel).await?;
        for monitor in &monitors {
            self.metrics.inc_mutation("delete");
            guarded(
                cancel,
                self.store.delete_monitor(&monitor.namespace, &monitor.name),
            )
            .await?;
            self.logger
                .log_monitor_deleted(&key.to_string(), &monitor.to_string());
        }
        Ok(ReconcileOutcome::Deleted { monitors })
    }
}

fn monitor_key(monitor: &ServiceMonitor) -> MonitorKey {
    MonitorKey {
        namespace: monitor.namespace().unwrap_or_default(),
        name: monitor.name_any(),
    }
}

/// The monitor responsible for a Service within one list snapshot
///
/// First monitor whose selector matches the Service labels and which scrapes
/// one of its port names; failing that, the monitor with the derived name.
pub fn discover<'a>(
    snapshot: &'a [ServiceMonitor],
    labels: &BTreeMap<String, String>,
    port_names: &[&str],
    derived: &MonitorKey,
) -> Option<&'a ServiceMonitor> {
    snapshot
        .iter()
        .find(|monitor| {
            selector::matches(&monitor.spec.selector, labels)
                && monitor
                    .spec
                    .endpoints
                    .iter()
                    .filter_map(|e| e.port.as_deref())
                    .any(|port| port_names.contains(&port))
        })
        .or_else(|| {
            snapshot.iter().find(|monitor| {
                monitor.name_any() == derived.name
                    && monitor.namespace().as_deref() == Some(derived.namespace.as_str())
            })
        })
}
