//! ServiceMonitor listing

use anyhow::{Context, Result};
use controller_lib::{ServiceMonitor, OWNER_ANNOTATION};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{color_status, print_json, print_table, OutputFormat};

/// One ServiceMonitor, flattened for display
#[derive(Debug, Serialize, PartialEq)]
struct MonitorSummary {
    name: String,
    namespace: String,
    ports: Vec<String>,
    interval: String,
    selector: String,
    owner: Option<String>,
}

/// Row for the monitors table
#[derive(Tabled)]
struct MonitorRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Ports")]
    ports: String,
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "Selector")]
    selector: String,
    #[tabled(rename = "Owner")]
    owner: String,
}

/// List ServiceMonitors in `namespace`, marking the ones this tool manages
pub async fn list_monitors(client: Client, namespace: &str, format: OutputFormat) -> Result<()> {
    let api: Api<ServiceMonitor> = Api::namespaced(client, namespace);
    let monitors = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("Failed to list ServiceMonitors in {}", namespace))?;

    let mut summaries: Vec<MonitorSummary> = monitors.items.iter().map(summarize).collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        OutputFormat::Json => print_json(&summaries)?,
        OutputFormat::Table => print_table(summaries.into_iter().map(row).collect()),
    }
    Ok(())
}

fn summarize(monitor: &ServiceMonitor) -> MonitorSummary {
    let endpoints = &monitor.spec.endpoints;
    let selector = monitor
        .spec
        .selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();

    MonitorSummary {
        name: monitor.name_any(),
        namespace: monitor.namespace().unwrap_or_default(),
        ports: endpoints
            .iter()
            .map(|e| e.port.clone().unwrap_or_default())
            .collect(),
        interval: endpoints
            .first()
            .and_then(|e| e.interval.clone())
            .unwrap_or_default(),
        selector,
        owner: monitor.annotations().get(OWNER_ANNOTATION).cloned(),
    }
}

fn row(summary: MonitorSummary) -> MonitorRow {
    MonitorRow {
        name: summary.name,
        ports: summary.ports.join(","),
        interval: summary.interval,
        selector: summary.selector,
        owner: match summary.owner {
            Some(owner) => color_status(&owner),
            None => color_status("unowned"),
        },
    }
}
