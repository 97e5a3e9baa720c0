//! Cluster connection and reconciler wiring shared by the commands

use anyhow::{Context, Result};
use controller_lib::{
    probe::{EndpointProber, HttpProbeTransport},
    store::KubeStore,
    ReconcileConfig, Reconciler, ServiceKey, StructuredLogger,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::sync::Arc;
use tracing::debug;

/// Connect with an explicit kubeconfig, else the inferred configuration
pub async fn connect(kubeconfig: Option<&str>) -> Result<Client> {
    debug!(kubeconfig = ?kubeconfig, "Connecting to cluster");
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

pub fn prober(config: &ReconcileConfig) -> Result<EndpointProber> {
    let transport = HttpProbeTransport::new().context("Failed to build probe HTTP client")?;
    Ok(EndpointProber::new(Arc::new(transport), config.probe.clone()))
}

pub fn reconciler(client: Client, config: ReconcileConfig) -> Result<Reconciler> {
    let prober = prober(&config)?;
    Ok(Reconciler::new(
        Arc::new(KubeStore::new(client)),
        prober,
        Arc::new(config),
        StructuredLogger::new("smscale-cli"),
    ))
}

/// Accept `namespace/name` or a bare name in `default_namespace`
pub fn service_key(raw: &str, default_namespace: &str) -> Result<ServiceKey> {
    if raw.contains('/') {
        raw.parse::<ServiceKey>().map_err(anyhow::Error::msg)
    } else if raw.is_empty() {
        anyhow::bail!("service name must not be empty")
    } else {
        Ok(ServiceKey::new(default_namespace, raw))
    }
}
