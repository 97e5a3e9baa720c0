//! One-shot reconciliation

use anyhow::{Context, Result};
use controller_lib::{ReconcileOutcome, Reconciler, ServiceKey};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::output::{print_info, print_json, print_success, print_warning, OutputFormat};

/// Run a single pass for one Service against the cluster
pub async fn reconcile_service(
    reconciler: &Reconciler,
    key: &ServiceKey,
    cancel: &CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    let outcome = reconciler
        .reconcile(key, cancel)
        .await
        .with_context(|| format!("Reconciliation of {} failed", key))?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "service": key.to_string(),
            "outcome": outcome.label(),
            "monitors": monitors(&outcome),
        }))?,
        OutputFormat::Table => print_outcome(key, &outcome),
    }
    Ok(())
}

fn monitors(outcome: &ReconcileOutcome) -> Vec<String> {
    match outcome {
        ReconcileOutcome::Created { monitor }
        | ReconcileOutcome::Updated { monitor, .. }
        | ReconcileOutcome::Unchanged { monitor } => vec![monitor.to_string()],
        ReconcileOutcome::Deleted { monitors } => monitors.iter().map(|m| m.to_string()).collect(),
        ReconcileOutcome::Unhealthy { .. } | ReconcileOutcome::Skipped => Vec::new(),
    }
}

fn print_outcome(key: &ServiceKey, outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Created { monitor } => {
            print_success(&format!("Created ServiceMonitor {} for {}", monitor, key));
        }
        ReconcileOutcome::Updated { monitor, fields } => {
            print_success(&format!(
                "Updated ServiceMonitor {} ({})",
                monitor,
                fields.join(", ")
            ));
        }
        ReconcileOutcome::Unchanged { monitor } => {
            print_info(&format!("ServiceMonitor {} already up to date", monitor));
        }
        ReconcileOutcome::Unhealthy { probed_ports } => {
            print_warning(&format!(
                "{} has no healthy metrics endpoint ({} port(s) probed)",
                key, probed_ports
            ));
        }
        ReconcileOutcome::Deleted { monitors } if monitors.is_empty() => {
            print_info(&format!("{} no longer exists; nothing to delete", key));
        }
        ReconcileOutcome::Deleted { monitors } => {
            for monitor in monitors {
                print_success(&format!("Deleted ServiceMonitor {}", monitor));
            }
        }
        ReconcileOutcome::Skipped => {
            print_warning(&format!(
                "Namespace {} is not watched (see --service-namespaces)",
                key.namespace
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_lib::MonitorKey;

    fn key(name: &str) -> MonitorKey {
        MonitorKey {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_monitors_per_outcome() {
        assert_eq!(
            monitors(&ReconcileOutcome::Created { monitor: key("web") }),
            vec!["default/web"]
        );
        assert_eq!(
            monitors(&ReconcileOutcome::Deleted {
                monitors: vec![key("a"), key("b")]
            }),
            vec!["default/a", "default/b"]
        );
        assert!(monitors(&ReconcileOutcome::Unhealthy { probed_ports: 2 }).is_empty());
        assert!(monitors(&ReconcileOutcome::Skipped).is_empty());
    }
}
