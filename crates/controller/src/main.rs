//! smscale-controller - ServiceMonitor lifecycle controller
//!
//! Watches Services, probes their metrics endpoints and keeps one
//! ServiceMonitor per healthy Service in step with it.

use anyhow::{Context, Result};
use controller_lib::{
    controller::{run_controller, ControllerContext},
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    probe::{EndpointProber, HttpProbeTransport},
    store::KubeStore,
    Reconciler,
};
use servicemonitor_controller::{api, config::ControllerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting smscale-controller");

    let config = ControllerConfig::load()?;
    info!(
        controller_id = %config.controller_id,
        namespaces = %config.reconcile.service_namespaces,
        monitor_namespace = %config.reconcile.monitor_namespace,
        "Controller configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SERVICE_WATCHER).await;
    health_registry.register(components::OBJECT_STORE).await;
    health_registry.register(components::PROBER).await;

    let metrics = ControllerMetrics::new();

    let logger = StructuredLogger::new(&config.controller_id);
    logger.log_startup(
        CONTROLLER_VERSION,
        &config.reconcile.service_namespaces.to_string(),
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let transport = HttpProbeTransport::new().context("Failed to build probe HTTP client")?;
    let prober = EndpointProber::new(Arc::new(transport), config.reconcile.probe.clone());
    let reconciler = Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        prober,
        Arc::new(config.reconcile.clone()),
        logger.clone(),
    );

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(ControllerContext::new(
        reconciler,
        health_registry.clone(),
        shutdown.clone(),
    ));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, metrics));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    let mut controller = tokio::spawn(run_controller(client, ctx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
            shutdown.cancel();
            controller.await.context("Controller task failed")?;
        }
        joined = &mut controller => {
            joined.context("Controller task failed")?;
            logger.log_shutdown("Service watch ended");
            shutdown.cancel();
        }
        served = &mut api_handle => {
            logger.log_shutdown("API server stopped");
            shutdown.cancel();
            controller.await.context("Controller task failed")?;
            return served.context("API server task failed")?;
        }
    }

    api_handle
        .await
        .context("API server task failed")?
        .context("API server failed")?;
    info!("Shutdown complete");

    Ok(())
}
