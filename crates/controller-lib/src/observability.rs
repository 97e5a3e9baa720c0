//! Observability infrastructure for the controller
//!
//! Provides:
//! - Prometheus metrics (pass outcomes, mutations, probe attempts and latency)
//! - Structured JSON logging of reconciliation decisions with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
    HistogramVec, IntCounterVec, Encoder, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for probe attempts (seconds); the upper end covers the 10s timeout
const PROBE_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Buckets for whole passes, which include probe retries and backoff
const PASS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    reconciliations: IntCounterVec,
    reconcile_errors: IntCounterVec,
    mutations: IntCounterVec,
    probe_attempts: IntCounterVec,
    probe_duration_seconds: Histogram,
    reconcile_duration_seconds: HistogramVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            reconciliations: register_int_counter_vec!(
                "smscale_reconciliations_total",
                "Completed reconciliation passes by outcome",
                &["outcome"]
            )
            .expect("Failed to register reconciliations_total"),

            reconcile_errors: register_int_counter_vec!(
                "smscale_reconcile_errors_total",
                "Failed reconciliation passes by error kind",
                &["kind"]
            )
            .expect("Failed to register reconcile_errors_total"),

            mutations: register_int_counter_vec!(
                "smscale_mutations_total",
                "Mutating calls issued against the cluster by kind",
                &["kind"]
            )
            .expect("Failed to register mutations_total"),

            probe_attempts: register_int_counter_vec!(
                "smscale_probe_attempts_total",
                "Metrics endpoint probe attempts by result",
                &["result"]
            )
            .expect("Failed to register probe_attempts_total"),

            probe_duration_seconds: register_histogram!(
                "smscale_probe_duration_seconds",
                "Time spent in a single metrics endpoint probe attempt",
                PROBE_BUCKETS.to_vec()
            )
            .expect("Failed to register probe_duration_seconds"),

            reconcile_duration_seconds: register_histogram_vec!(
                "smscale_reconcile_duration_seconds",
                "Time spent in a reconciliation pass",
                &["result"],
                PASS_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn inc_reconciliation(&self, outcome: &str) {
        self.inner()
            .reconciliations
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_reconcile_error(&self, kind: &str) {
        self.inner()
            .reconcile_errors
            .with_label_values(&[kind])
            .inc();
    }

    /// Count a create/update/delete/patch call
    pub fn inc_mutation(&self, kind: &str) {
        self.inner().mutations.with_label_values(&[kind]).inc();
    }

    pub fn inc_probe_attempt(&self, result: &str) {
        self.inner()
            .probe_attempts
            .with_label_values(&[result])
            .inc();
    }

    pub fn observe_probe_duration(&self, duration_secs: f64) {
        self.inner().probe_duration_seconds.observe(duration_secs);
    }

    pub fn observe_reconcile_duration(&self, result: &str, duration_secs: f64) {
        self.inner()
            .reconcile_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    /// Text exposition of every metric in the default registry
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for reconciliation decisions
///
/// One JSON event per decision so that a Service's monitoring history can be
/// followed with a single `event` filter.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    controller_id: String,
}

impl StructuredLogger {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
        }
    }

    pub fn log_monitor_created(&self, service: &str, monitor: &str, port: &str, interval: &str) {
        info!(
            event = "monitor_created",
            controller = %self.controller_id,
            service = %service,
            monitor = %monitor,
            port = %port,
            interval = %interval,
            "ServiceMonitor created"
        );
    }

    pub fn log_monitor_updated(&self, service: &str, monitor: &str, fields: &[&str]) {
        info!(
            event = "monitor_updated",
            controller = %self.controller_id,
            service = %service,
            monitor = %monitor,
            fields = ?fields,
            "ServiceMonitor updated"
        );
    }

    pub fn log_monitor_unchanged(&self, service: &str, monitor: &str) {
        info!(
            event = "monitor_unchanged",
            controller = %self.controller_id,
            service = %service,
            monitor = %monitor,
            "ServiceMonitor does not need to be updated"
        );
    }

    pub fn log_monitor_deleted(&self, service: &str, monitor: &str) {
        info!(
            event = "monitor_deleted",
            controller = %self.controller_id,
            service = %service,
            monitor = %monitor,
            "ServiceMonitor deleted for removed Service"
        );
    }

    pub fn log_endpoint_unhealthy(&self, service: &str, probed_ports: usize) {
        info!(
            event = "endpoint_unhealthy",
            controller = %self.controller_id,
            service = %service,
            probed_ports = probed_ports,
            "Service metrics are unhealthy, ServiceMonitor left untouched"
        );
    }

    pub fn log_service_patch_failed(&self, service: &str, patch: &str, error: &str) {
        warn!(
            event = "service_patch_failed",
            controller = %self.controller_id,
            service = %service,
            patch = %patch,
            error = %error,
            "Failed to patch Service, continuing"
        );
    }

    pub fn log_startup(&self, version: &str, namespaces: &str) {
        info!(
            event = "controller_started",
            controller = %self.controller_id,
            version = %version,
            namespaces = %namespaces,
            "ServiceMonitor controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller_id,
            reason = %reason,
            "ServiceMonitor controller shutting down"
        );
    }
}
