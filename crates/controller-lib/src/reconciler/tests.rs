//! Engine scenarios against the in-memory store
//!
//! These tests verify:
//! - Idempotence and convergence of repeated passes
//! - Health gating and port naming precedence
//! - Deletion, conflict handling and cancellation

use super::*;
use crate::models::{Endpoint, ServiceMonitorSpec, APP_LABEL, RELEASE_LABEL, RELEASE_VALUE};
use crate::probe::{FailureKind, ProbeConfig, ProbeTransport, TransportError};
use crate::store::{InMemoryStore, StoreCall, StoreOp};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};

/// Answers every probe the same way
struct FixedTransport {
    response: Result<u16, TransportError>,
    delay: Duration,
    calls: AtomicU32,
}

impl FixedTransport {
    fn status(status: u16) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(status),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    fn refused() -> Arc<Self> {
        Arc::new(Self {
            response: Err(TransportError::new(
                FailureKind::ConnectionRefused,
                "connection refused",
            )),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(200),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeTransport for FixedTransport {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<u16, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.clone()
    }
}

fn test_config() -> ReconcileConfig {
    ReconcileConfig {
        probe: ProbeConfig {
            backoff: Duration::from_millis(1),
            ..ProbeConfig::default()
        },
        ..ReconcileConfig::default()
    }
}

fn reconciler_with(
    store: &InMemoryStore,
    transport: Arc<FixedTransport>,
    config: ReconcileConfig,
) -> Reconciler {
    let prober = EndpointProber::new(transport, config.probe.clone());
    Reconciler::new(
        Arc::new(store.clone()),
        prober,
        Arc::new(config),
        StructuredLogger::new("test"),
    )
}

fn reconciler(store: &InMemoryStore, transport: Arc<FixedTransport>) -> Reconciler {
    reconciler_with(store, transport, test_config())
}

/// Service `demo/<name>` with the given app label and port names
fn service(name: &str, app: Option<&str>, ports: &[&str]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("demo".to_string()),
            labels: app.map(|a| BTreeMap::from([(APP_LABEL.to_string(), a.to_string())])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(
                ports
                    .iter()
                    .enumerate()
                    .map(|(i, name)| ServicePort {
                        name: Some(name.to_string()),
                        port: 8080 + i as i32,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn key(name: &str) -> ServiceKey {
    ServiceKey::new("demo", name)
}

fn monitor(name: &str, selector: &[(&str, &str)], port: &str, interval: &str) -> ServiceMonitor {
    ServiceMonitor {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                match_expressions: None,
            },
            endpoints: vec![Endpoint {
                port: Some(port.to_string()),
                path: Some("/metrics".to_string()),
                interval: Some(interval.to_string()),
                extra: BTreeMap::new(),
            }],
            ..Default::default()
        },
    }
}

fn canonical_selector() -> Vec<(&'static str, &'static str)> {
    vec![(RELEASE_LABEL, RELEASE_VALUE), (APP_LABEL, "foo")]
}

fn monitor_key(name: &str) -> MonitorKey {
    MonitorKey {
        namespace: "default".to_string(),
        name: name.to_string(),
    }
}

mod creation_tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_monitor_for_healthy_service() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                monitor: monitor_key("foo")
            }
        );
        let created = store.monitor("default", "foo").await.unwrap();
        let labels = created.metadata.labels.unwrap();
        assert_eq!(labels[RELEASE_LABEL], RELEASE_VALUE);
        assert_eq!(labels[APP_LABEL], "foo");
        let endpoint = &created.spec.endpoints[0];
        assert_eq!(endpoint.port.as_deref(), Some("web"));
        assert_eq!(endpoint.path.as_deref(), Some("/metrics"));
        assert_eq!(endpoint.interval.as_deref(), Some("15s"));
        assert_eq!(
            created.spec.namespace_selector.unwrap().match_names,
            vec!["demo".to_string()]
        );

        // Discovery label was injected on the Service
        let svc = store.service("demo", "foo").await.unwrap();
        assert_eq!(svc.labels()[RELEASE_LABEL], RELEASE_VALUE);
    }

    #[tokio::test]
    async fn test_port_naming_precedence() {
        let store = InMemoryStore::new();
        store.insert_service(service("svc", Some("foo"), &["", "web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        reconciler
            .reconcile(&key("svc"), &CancellationToken::new())
            .await
            .unwrap();

        // Last named port is the scraped port, the monitor is named after the app
        let created = store.monitor("default", "foo").await.unwrap();
        assert_eq!(created.spec.endpoints[0].port.as_deref(), Some("web"));

        // The empty port was renamed from the label
        let svc = store.service("demo", "svc").await.unwrap();
        let names: Vec<_> = svc
            .spec
            .unwrap()
            .ports
            .unwrap()
            .into_iter()
            .map(|p| p.name.unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["foo", "web"]);
    }

    #[tokio::test]
    async fn test_service_patch_failure_is_not_fatal() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .fail_next(StoreOp::PatchService, StoreError::Transient("reset".into()))
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.label(), "created");
    }

    #[tokio::test]
    async fn test_create_failure_is_surfaced() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .fail_next(
                StoreOp::CreateMonitor,
                StoreError::Rejected {
                    code: 403,
                    message: "forbidden".into(),
                },
            )
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "rejected");
        assert_eq!(store.monitor_count().await, 0);
    }

    #[tokio::test]
    async fn test_service_without_ports_is_configuration_error() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &[])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Configuration(_)));
        assert!(err.retry_after().is_none());
    }

    #[tokio::test]
    async fn test_missing_crd_is_configuration_error() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .fail_next(
                StoreOp::ListMonitors,
                StoreError::NotFound("the server could not find the requested resource".into()),
            )
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unwatched_namespace_is_skipped() {
        let store = InMemoryStore::new();
        let mut svc = service("foo", Some("foo"), &["web"]);
        svc.metadata.namespace = Some("kube-system".to_string());
        store.insert_service(svc).await;
        let transport = FixedTransport::status(200);
        let reconciler = reconciler(&store, transport.clone());

        let outcome = reconciler
            .reconcile(&ServiceKey::new("kube-system", "foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert!(store.calls().await.is_empty());
        assert_eq!(transport.calls(), 0);
    }
}

mod convergence_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_pass_issues_no_mutations() {
        let store = InMemoryStore::new();
        store.insert_service(service("svc", Some("foo"), &["", "web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();

        reconciler.reconcile(&key("svc"), &cancel).await.unwrap();
        assert!(!store.calls().await.is_empty());
        store.clear_calls().await;

        let outcome = reconciler.reconcile(&key("svc"), &cancel).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Unchanged {
                monitor: monitor_key("foo")
            }
        );
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_service_without_app_label_is_idempotent() {
        let store = InMemoryStore::new();
        store.insert_service(service("plain", None, &[""])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();

        reconciler.reconcile(&key("plain"), &cancel).await.unwrap();
        store.clear_calls().await;
        let outcome = reconciler.reconcile(&key("plain"), &cancel).await.unwrap();

        assert_eq!(outcome.label(), "unchanged");
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_divergent_monitor_gets_one_update() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        let mut live = monitor("foo", &canonical_selector(), "web", "30s");
        live.spec.extra.insert("jobLabel".into(), json!("app"));
        live.spec.endpoints[0]
            .extra
            .insert("scheme".into(), json!("https"));
        store.insert_monitor(live).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();

        let outcome = reconciler.reconcile(&key("foo"), &cancel).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                monitor: monitor_key("foo"),
                fields: vec!["endpoints"]
            }
        );
        assert_eq!(
            store.monitor_writes().await,
            vec![StoreCall::UpdateMonitor {
                namespace: "default".into(),
                name: "foo".into()
            }]
        );
        let updated = store.monitor("default", "foo").await.unwrap();
        assert_eq!(updated.spec.endpoints[0].interval.as_deref(), Some("15s"));
        assert_eq!(updated.spec.endpoints[0].extra["scheme"], "https");
        assert_eq!(updated.spec.extra["jobLabel"], "app");

        store.clear_calls().await;
        let outcome = reconciler.reconcile(&key("foo"), &cancel).await.unwrap();
        assert_eq!(outcome.label(), "unchanged");
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_existing_monitor_found_by_selector_and_port() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .insert_monitor(monitor("legacy", &canonical_selector(), "web", "15s"))
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Unchanged {
                monitor: monitor_key("legacy")
            }
        );
        assert_eq!(store.monitor_count().await, 1);
    }

    #[tokio::test]
    async fn test_monitor_with_other_port_is_not_claimed() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .insert_monitor(monitor("other", &[(APP_LABEL, "foo")], "grpc", "15s"))
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.label(), "created");
        assert_eq!(store.monitor_count().await, 2);
    }
}

mod health_gating_tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_service_gets_no_monitor() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        let transport = FixedTransport::refused();
        let reconciler = reconciler(&store, transport.clone());

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unhealthy { probed_ports: 1 });
        assert_eq!(transport.calls(), 3);
        assert!(store.monitor_writes().await.is_empty());
        assert_eq!(
            outcome.requeue_after(reconciler.config()),
            Some(Duration::from_secs(300))
        );
    }

    #[tokio::test]
    async fn test_unhealthy_service_leaves_divergent_monitor_alone() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .insert_monitor(monitor("foo", &canonical_selector(), "web", "30s"))
            .await;
        let transport = FixedTransport::status(503);
        let reconciler = reconciler(&store, transport.clone());

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.label(), "unhealthy");
        assert_eq!(transport.calls(), 1);
        assert!(store.monitor_writes().await.is_empty());
    }
}

mod deletion_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_service_deletes_derived_identity() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Deleted {
                monitors: vec![monitor_key("foo")]
            }
        );
        assert_eq!(
            store.calls().await,
            vec![StoreCall::DeleteMonitor {
                namespace: "default".into(),
                name: "foo".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_deleted_service_removes_owned_monitor() {
        let store = InMemoryStore::new();
        store.insert_service(service("svc", Some("foo"), &["web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();
        reconciler.reconcile(&key("svc"), &cancel).await.unwrap();
        assert!(store.monitor("default", "foo").await.is_some());

        store.remove_service("demo", "svc").await;
        let outcome = reconciler
            .reconcile_deleted(&key("svc"), None, &cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Deleted {
                monitors: vec![monitor_key("foo")]
            }
        );
        assert_eq!(store.monitor_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_path_is_repeatable() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let outcome = reconciler
                .reconcile_deleted(&key("svc"), Some("foo"), &cancel)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                ReconcileOutcome::Deleted {
                    monitors: vec![monitor_key("foo")]
                }
            );
        }
    }
}

mod conflict_tests {
    use super::*;

    #[tokio::test]
    async fn test_conflict_refetches_and_retries_once() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .insert_monitor(monitor("foo", &canonical_selector(), "web", "30s"))
            .await;
        store
            .fail_next(StoreOp::UpdateMonitor, StoreError::Conflict("stale".into()))
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let outcome = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.label(), "updated");
        assert_eq!(store.monitor_writes().await.len(), 2);
        let updated = store.monitor("default", "foo").await.unwrap();
        assert_eq!(updated.spec.endpoints[0].interval.as_deref(), Some("15s"));
    }

    #[tokio::test]
    async fn test_repeated_conflict_is_retryable_error() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .insert_monitor(monitor("foo", &canonical_selector(), "web", "30s"))
            .await;
        for _ in 0..2 {
            store
                .fail_next(StoreOp::UpdateMonitor, StoreError::Conflict("stale".into()))
                .await;
        }
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Conflict(_)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(store.monitor_writes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_race_without_object_is_conflict() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        store
            .fail_next(
                StoreOp::CreateMonitor,
                StoreError::AlreadyExists("servicemonitors/default/foo".into()),
            )
            .await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        // The create failed but nothing appeared on re-read
        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Conflict(_)));
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_pass_reports_cancellation() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler.reconcile(&key("foo"), &cancel).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Cancelled));
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_pass_deadline() {
        let store = InMemoryStore::new();
        store.insert_service(service("foo", Some("foo"), &["web"])).await;
        let config = ReconcileConfig {
            pass_timeout: Duration::from_millis(20),
            ..test_config()
        };
        let reconciler = reconciler_with(&store, FixedTransport::slow(Duration::from_secs(5)), config);

        let err = reconciler
            .reconcile(&key("foo"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::DeadlineExceeded(_)));
        assert!(store.monitor_writes().await.is_empty());
    }
}

mod plan_tests {
    use super::*;

    #[tokio::test]
    async fn test_plan_writes_nothing() {
        let store = InMemoryStore::new();
        store.insert_service(service("svc", Some("foo"), &["", "web"])).await;
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let plan = reconciler
            .plan(&key("svc"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(plan.service_patches.len(), 2);
        match plan.decision {
            Decision::Create { desired } => {
                assert_eq!(desired.key, monitor_key("foo"));
                assert_eq!(desired.port(), "web");
            }
            other => panic!("expected create, got {:?}", other),
        }
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_plan_for_missing_service_lists_deletions() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store, FixedTransport::status(200));

        let plan = reconciler
            .plan(&key("gone"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(plan.decision, Decision::Delete { ref monitors } if monitors == &vec![monitor_key("gone")]));
        assert!(store.calls().await.is_empty());
    }
}
