//! Metrics endpoint probing

use anyhow::{Context, Result};
use colored::Colorize;
use controller_lib::probe::{metrics_url, EndpointProber, PortProbe, ProbeOutcome, UnhealthyReason};
use controller_lib::ServiceKey;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use serde_json::json;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

use crate::output::{color_status, print_heading, print_json, print_success, print_table, print_warning, OutputFormat};

/// Row for the probe table
#[derive(Tabled)]
struct ProbeRow {
    #[tabled(rename = "Port")]
    port: i32,
    #[tabled(rename = "URL")]
    url: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Probe the metrics endpoints of a Service
///
/// With `address`, every port is probed on that address instead of the
/// Service's cluster address (e.g. through a port-forward).
pub async fn probe_service(
    client: Client,
    prober: &EndpointProber,
    key: &ServiceKey,
    address: Option<&str>,
    cancel: &CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client, &key.namespace);
    let service = api
        .get_opt(&key.name)
        .await
        .context("Failed to fetch Service")?
        .with_context(|| format!("Service {} not found", key))?;

    let probes = match address {
        Some(address) => probe_ports_at(prober, &service, address, cancel).await?,
        None => prober.probe_service(&service, cancel).await?.ports,
    };

    match format {
        OutputFormat::Json => {
            let items: Vec<_> = probes
                .iter()
                .map(|p| {
                    json!({
                        "port": p.port,
                        "url": p.url,
                        "healthy": p.outcome.is_healthy(),
                        "reason": reason(&p.outcome),
                        "attempts": p.outcome.attempts(),
                    })
                })
                .collect();
            print_json(&json!({ "service": key.to_string(), "ports": items }))?;
        }
        OutputFormat::Table => {
            print_heading(&format!("Metrics endpoints of {}", key.to_string().cyan()));
            let healthy = probes.iter().any(|p| p.outcome.is_healthy());
            print_table(probes.into_iter().map(row).collect());
            println!();
            if healthy {
                print_success("Service qualifies for a ServiceMonitor");
            } else {
                print_warning("No port answered with HTTP 200; no ServiceMonitor would be managed");
            }
        }
    }

    Ok(())
}

async fn probe_ports_at(
    prober: &EndpointProber,
    service: &Service,
    address: &str,
    cancel: &CancellationToken,
) -> Result<Vec<PortProbe>> {
    let ports: Vec<i32> = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default();

    let mut probes = Vec::new();
    for port in ports {
        let url = metrics_url(address, port, &prober.config().path)?;
        let outcome = prober.probe_url(&url, cancel).await?;
        let healthy = outcome.is_healthy();
        probes.push(PortProbe { port, url, outcome });
        if healthy {
            break;
        }
    }
    Ok(probes)
}

fn row(probe: PortProbe) -> ProbeRow {
    let result = if probe.outcome.is_healthy() {
        "healthy"
    } else {
        "unhealthy"
    };
    ProbeRow {
        port: probe.port,
        reason: reason(&probe.outcome),
        attempts: probe.outcome.attempts(),
        url: probe.url,
        result: color_status(result),
    }
}

fn reason(outcome: &ProbeOutcome) -> String {
    match outcome {
        ProbeOutcome::Healthy { .. } => "-".to_string(),
        ProbeOutcome::Unhealthy { reason, .. } => match reason {
            UnhealthyReason::Status(code) => format!("HTTP {}", code),
            UnhealthyReason::Timeout => "timeout".to_string(),
            UnhealthyReason::Exhausted(kind) => format!("{} (retries exhausted)", kind.as_str()),
        },
    }
}
