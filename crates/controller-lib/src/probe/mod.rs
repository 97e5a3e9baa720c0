//! Metrics endpoint health probing
//!
//! A Service only gets a ServiceMonitor once one of its ports answers
//! `GET /metrics` with HTTP 200. Each port gets a bounded number of attempts:
//! a non-200 answer or a timed-out attempt ends probing of that port at once,
//! while connection failures are retried after a fixed backoff.

mod transport;

pub use transport::{FailureKind, HttpProbeTransport, ProbeTransport, TransportError};

use crate::error::ReconcileError;
use crate::models::METRICS_PATH;
use crate::observability::ControllerMetrics;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Probe settings
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Timeout of a single attempt
    pub timeout: Duration,
    /// Attempts per port, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            path: METRICS_PATH.to_string(),
        }
    }
}

/// Why a port was judged unhealthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// The endpoint answered with something other than 200
    Status(u16),
    /// An attempt hit its timeout
    Timeout,
    /// Every attempt failed to connect
    Exhausted(FailureKind),
}

/// Result of probing one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { attempts: u32 },
    Unhealthy { reason: UnhealthyReason, attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProbeOutcome::Healthy { attempts } | ProbeOutcome::Unhealthy { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Probe result for one Service port
#[derive(Debug, Clone)]
pub struct PortProbe {
    pub port: i32,
    pub url: String,
    pub outcome: ProbeOutcome,
}

/// Probe results for a Service, in port order, stopping at the first healthy port
#[derive(Debug, Clone, Default)]
pub struct ServiceHealth {
    pub ports: Vec<PortProbe>,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.healthy_port().is_some()
    }

    pub fn healthy_port(&self) -> Option<&PortProbe> {
        self.ports.iter().find(|p| p.outcome.is_healthy())
    }
}

/// Probes Service metrics endpoints over a [`ProbeTransport`]
#[derive(Clone)]
pub struct EndpointProber {
    transport: Arc<dyn ProbeTransport>,
    config: ProbeConfig,
    metrics: ControllerMetrics,
}

impl EndpointProber {
    pub fn new(transport: Arc<dyn ProbeTransport>, config: ProbeConfig) -> Self {
        Self {
            transport,
            config,
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe a single URL with the configured attempt budget
    ///
    /// Only cancellation is an error; every probe result, healthy or not, is `Ok`.
    pub async fn probe_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ReconcileError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure = FailureKind::Other;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                result = self.transport.get(url, self.config.timeout) => result,
            };
            self.metrics
                .observe_probe_duration(started.elapsed().as_secs_f64());

            match result {
                Ok(200) => {
                    self.metrics.inc_probe_attempt("healthy");
                    return Ok(ProbeOutcome::Healthy { attempts: attempt });
                }
                Ok(status) => {
                    self.metrics.inc_probe_attempt("bad_status");
                    info!(url = %url, status = status, "Metrics endpoint returned non-200 status");
                    return Ok(ProbeOutcome::Unhealthy {
                        reason: UnhealthyReason::Status(status),
                        attempts: attempt,
                    });
                }
                Err(err) if err.kind.is_terminal() => {
                    self.metrics.inc_probe_attempt(err.kind.as_str());
                    info!(url = %url, error = %err.message, "Metrics endpoint timed out");
                    return Ok(ProbeOutcome::Unhealthy {
                        reason: UnhealthyReason::Timeout,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    self.metrics.inc_probe_attempt(err.kind.as_str());
                    debug!(
                        url = %url,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %err.message,
                        "Metrics endpoint unreachable"
                    );
                    last_failure = err.kind;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                    _ = tokio::time::sleep(self.config.backoff) => {}
                }
            }
        }

        info!(url = %url, attempts = max_attempts, "Metrics endpoint unreachable after retries");
        Ok(ProbeOutcome::Unhealthy {
            reason: UnhealthyReason::Exhausted(last_failure),
            attempts: max_attempts,
        })
    }

    /// Probe the Service's ports in order until one is healthy
    ///
    /// Fails with [`ReconcileError::Configuration`] when there is nothing to
    /// probe: no ports, or no address to reach them on.
    pub async fn probe_service(
        &self,
        service: &Service,
        cancel: &CancellationToken,
    ) -> Result<ServiceHealth, ReconcileError> {
        let ports: Vec<i32> = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port).filter(|p| *p > 0).collect())
            .unwrap_or_default();
        if ports.is_empty() {
            return Err(ReconcileError::configuration(format!(
                "service {} exposes no port to probe",
                service.name_any()
            )));
        }

        let address = service_address(service).ok_or_else(|| {
            ReconcileError::configuration(format!(
                "service {} has no namespace to build an address from",
                service.name_any()
            ))
        })?;

        let mut health = ServiceHealth::default();
        for port in ports {
            let url = metrics_url(&address, port, &self.config.path)?;
            let outcome = self.probe_url(&url, cancel).await?;
            let healthy = outcome.is_healthy();
            health.ports.push(PortProbe { port, url, outcome });
            if healthy {
                break;
            }
        }
        Ok(health)
    }
}

/// Address a Service is reachable on from inside the cluster
///
/// The cluster IP when allocated, the `<name>.<namespace>.svc` DNS name for
/// headless Services.
pub fn service_address(service: &Service) -> Option<String> {
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None");

    match cluster_ip {
        Some(ip) => Some(ip.to_string()),
        None => {
            let namespace = service.namespace()?;
            Some(format!("{}.{}.svc", service.name_any(), namespace))
        }
    }
}

/// `http://<address>:<port><path>`
pub fn metrics_url(address: &str, port: i32, path: &str) -> Result<String, ReconcileError> {
    let host = if address.contains(':') {
        format!("[{}]", address)
    } else {
        address.to_string()
    };
    let raw = format!("http://{}:{}", host, port);
    let mut url = url::Url::parse(&raw)
        .map_err(|e| ReconcileError::configuration(format!("invalid probe address {}: {}", raw, e)))?;
    url.set_path(path);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses and records requested URLs
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<u16, TransportError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<u16, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProbeTransport for ScriptedTransport {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<u16, TransportError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new(FailureKind::ConnectionRefused, "script exhausted")))
        }
    }

    fn refused() -> Result<u16, TransportError> {
        Err(TransportError::new(
            FailureKind::ConnectionRefused,
            "connection refused",
        ))
    }

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            backoff: Duration::from_millis(1),
            ..ProbeConfig::default()
        }
    }

    fn service_with_ports(ports: &[i32], cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("demo".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(str::to_string),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_healthy_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(200)]);
        let prober = EndpointProber::new(transport.clone(), fast_config());

        let outcome = prober
            .probe_url("http://10.0.0.1:8080/metrics", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 1 });
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_twice_then_healthy() {
        let transport = ScriptedTransport::new(vec![refused(), refused(), Ok(200)]);
        let prober = EndpointProber::new(transport.clone(), fast_config());

        let outcome = prober
            .probe_url("http://10.0.0.1:8080/metrics", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 3 });
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_non_200_short_circuits() {
        let transport = ScriptedTransport::new(vec![Ok(503), Ok(200)]);
        let prober = EndpointProber::new(transport.clone(), fast_config());

        let outcome = prober
            .probe_url("http://10.0.0.1:8080/metrics", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProbeOutcome::Unhealthy {
                reason: UnhealthyReason::Status(503),
                attempts: 1
            }
        );
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_stops_retrying() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::new(FailureKind::Timeout, "timed out")),
            Ok(200),
        ]);
        let prober = EndpointProber::new(transport.clone(), fast_config());

        let outcome = prober
            .probe_url("http://10.0.0.1:8080/metrics", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProbeOutcome::Unhealthy {
                reason: UnhealthyReason::Timeout,
                attempts: 1
            }
        );
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_is_unhealthy_not_error() {
        let transport = ScriptedTransport::new(vec![refused(), refused(), refused(), Ok(200)]);
        let prober = EndpointProber::new(transport.clone(), fast_config());

        let outcome = prober
            .probe_url("http://10.0.0.1:8080/metrics", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProbeOutcome::Unhealthy {
                reason: UnhealthyReason::Exhausted(FailureKind::ConnectionRefused),
                attempts: 3
            }
        );
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_probe_reports_cancellation() {
        let transport = ScriptedTransport::new(vec![refused(), refused(), refused()]);
        let prober = EndpointProber::new(
            transport,
            ProbeConfig {
                backoff: Duration::from_secs(60),
                ..ProbeConfig::default()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = prober
            .probe_url("http://10.0.0.1:8080/metrics", &cancel)
            .await;

        assert!(matches!(result, Err(ReconcileError::Cancelled)));
    }

    #[tokio::test]
    async fn test_probe_service_stops_at_first_healthy_port() {
        let transport = ScriptedTransport::new(vec![Ok(404), Ok(200)]);
        let prober = EndpointProber::new(transport.clone(), fast_config());
        let service = service_with_ports(&[8080, 9090, 9100], Some("10.0.0.7"));

        let health = prober
            .probe_service(&service, &CancellationToken::new())
            .await
            .unwrap();

        assert!(health.is_healthy());
        assert_eq!(health.healthy_port().unwrap().port, 9090);
        assert_eq!(
            transport.calls(),
            vec![
                "http://10.0.0.7:8080/metrics".to_string(),
                "http://10.0.0.7:9090/metrics".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_service_without_ports_is_configuration_error() {
        let prober = EndpointProber::new(ScriptedTransport::new(vec![]), fast_config());
        let service = service_with_ports(&[], Some("10.0.0.7"));

        let result = prober
            .probe_service(&service, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ReconcileError::Configuration(_))));
    }

    #[test]
    fn test_service_address() {
        let service = service_with_ports(&[80], Some("10.0.0.7"));
        assert_eq!(service_address(&service).as_deref(), Some("10.0.0.7"));

        let headless = service_with_ports(&[80], Some("None"));
        assert_eq!(service_address(&headless).as_deref(), Some("web.demo.svc"));

        let unallocated = service_with_ports(&[80], None);
        assert_eq!(service_address(&unallocated).as_deref(), Some("web.demo.svc"));
    }

    #[test]
    fn test_metrics_url() {
        assert_eq!(
            metrics_url("web.demo.svc", 8080, "/metrics").unwrap(),
            "http://web.demo.svc:8080/metrics"
        );
        assert_eq!(
            metrics_url("fd00::1", 9090, "/metrics").unwrap(),
            "http://[fd00::1]:9090/metrics"
        );
    }
}
