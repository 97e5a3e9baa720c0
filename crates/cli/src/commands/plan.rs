//! Dry-run planning

use anyhow::Result;
use colored::Colorize;
use controller_lib::{Decision, Plan, Reconciler, ServiceKey};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::output::{color_status, print_heading, print_info, print_json, OutputFormat};

/// Show what a reconciliation pass would do, without writing
pub async fn show_plan(
    reconciler: &Reconciler,
    key: &ServiceKey,
    cancel: &CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    let plan = reconciler.plan(key, cancel).await?;

    match format {
        OutputFormat::Json => print_json(&plan_json(&plan))?,
        OutputFormat::Table => print_plan(&plan),
    }
    Ok(())
}

fn action(decision: &Decision) -> &'static str {
    match decision {
        Decision::Create { .. } => "create",
        Decision::Update { .. } => "update",
        Decision::Unchanged { .. } => "unchanged",
        Decision::SkipUnhealthy { .. } => "unhealthy",
        Decision::Delete { .. } => "delete",
        Decision::OutOfScope => "out-of-scope",
    }
}

fn plan_json(plan: &Plan) -> Value {
    let patches: Vec<Value> = plan
        .service_patches
        .iter()
        .map(|p| json!({ "kind": p.kind.as_str(), "patch": p.body }))
        .collect();

    let mut out = json!({
        "service": plan.service.to_string(),
        "action": action(&plan.decision),
        "servicePatches": patches,
    });

    match &plan.decision {
        Decision::Create { desired } => {
            out["monitor"] = json!(desired.key.to_string());
            out["desired"] = json!(desired.to_resource());
        }
        Decision::Update { desired, diff, .. } => {
            out["monitor"] = json!(desired.key.to_string());
            out["fields"] = json!(diff.fields());
            out["desired"] = json!(desired.to_resource());
        }
        Decision::Unchanged { desired, .. } => {
            out["monitor"] = json!(desired.key.to_string());
        }
        Decision::SkipUnhealthy { health } => {
            out["probedPorts"] = json!(health.ports.iter().map(|p| p.port).collect::<Vec<_>>());
        }
        Decision::Delete { monitors } => {
            out["monitors"] = json!(monitors.iter().map(|m| m.to_string()).collect::<Vec<_>>());
        }
        Decision::OutOfScope => {}
    }
    out
}

fn print_plan(plan: &Plan) {
    print_heading("Reconciliation Plan");
    println!("Service: {}", plan.service.to_string().cyan());
    println!("Action:  {}", color_status(action(&plan.decision)));
    println!();

    if plan.service_patches.is_empty() {
        println!("Service patches: none");
    } else {
        println!("Service patches:");
        for patch in &plan.service_patches {
            println!("  {} {}", patch.kind.as_str().bold(), patch.body);
        }
    }
    println!();

    match &plan.decision {
        Decision::Create { desired } => {
            println!("Create ServiceMonitor {}", desired.key.to_string().green());
            println!("  port:     {}", desired.port());
            println!("  interval: {}", desired.interval());
            println!("  selector: {}", format_labels(&desired.selector));
        }
        Decision::Update { desired, diff, .. } => {
            println!("Update ServiceMonitor {}", desired.key.to_string().yellow());
            println!("  fields:   {}", diff.fields().join(", "));
            println!("  port:     {}", desired.port());
            println!("  selector: {}", format_labels(&desired.selector));
        }
        Decision::Unchanged { desired, .. } => {
            print_info(&format!("ServiceMonitor {} already matches", desired.key));
        }
        Decision::SkipUnhealthy { health } => {
            print_info(&format!(
                "No healthy metrics endpoint on {} probed port(s); existing monitors are left alone",
                health.ports.len()
            ));
        }
        Decision::Delete { monitors } if monitors.is_empty() => {
            print_info("Service is gone and no ServiceMonitor belongs to it");
        }
        Decision::Delete { monitors } => {
            for monitor in monitors {
                println!("Delete ServiceMonitor {}", monitor.to_string().red());
            }
        }
        Decision::OutOfScope => {
            print_info(&format!(
                "Namespace {} is not watched (see --service-namespaces)",
                plan.service.namespace
            ));
        }
    }
}

fn format_labels(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
