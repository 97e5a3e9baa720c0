//! Service port-name normalization and discovery-label injection
//!
//! ServiceMonitor endpoints refer to ports by name, so every port needs one.
//! Ports are walked in order with an active name that starts as the
//! Service's `app` value; a named port replaces the active name and an
//! unnamed port takes it.

use crate::models::{app_value, RELEASE_LABEL, RELEASE_VALUE};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;
use serde_json::{json, Value};

/// Port list after normalization
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPorts {
    pub ports: Vec<ServicePort>,
    /// Active name once the walk is done: the last named port, or the `app`
    /// value when no port carried a name
    pub derived_name: String,
    /// Whether any port was renamed
    pub changed: bool,
}

impl NormalizedPorts {
    /// Names of every port, in order
    pub fn names(&self) -> Vec<&str> {
        self.ports
            .iter()
            .filter_map(|p| p.name.as_deref())
            .collect()
    }

    /// Merge patch replacing `spec.ports`; `None` when nothing changed
    ///
    /// Ports are a list, so the whole list is sent; only `name` differs from
    /// what the API server already holds.
    pub fn merge_patch(&self) -> Option<Value> {
        if !self.changed {
            return None;
        }
        Some(json!({ "spec": { "ports": self.ports } }))
    }
}

/// Fill empty port names without touching `service`
///
/// An unnamed port takes the name of the closest named port before it, or
/// the `app` value when there is none. The derived name is the `app` value
/// when a port already carries it, else the last named port, else the `app`
/// value.
pub fn normalize_ports(service: &Service) -> NormalizedPorts {
    let app = app_value(service);
    let mut active = app.clone();
    let mut matched = false;
    let mut changed = false;

    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| {
                    let mut port = port.clone();
                    match port.name.as_deref() {
                        Some(name) if !name.is_empty() => {
                            matched |= name == app;
                            active = name.to_string();
                        }
                        _ => {
                            port.name = Some(active.clone());
                            changed = true;
                        }
                    }
                    port
                })
                .collect()
        })
        .unwrap_or_default();

    NormalizedPorts {
        ports,
        derived_name: if matched { app } else { active },
        changed,
    }
}

/// Labels the Service will carry once the discovery label is in place
pub fn labels_with_discovery(service: &Service) -> std::collections::BTreeMap<String, String> {
    let mut labels = service.labels().clone();
    labels
        .entry(RELEASE_LABEL.to_string())
        .or_insert_with(|| RELEASE_VALUE.to_string());
    labels
}

/// Merge patch adding the discovery label; `None` when the key is present
///
/// An existing `release` label is never overwritten, whatever its value.
pub fn discovery_label_patch(service: &Service) -> Option<Value> {
    if service.labels().contains_key(RELEASE_LABEL) {
        return None;
    }
    Some(json!({ "metadata": { "labels": { RELEASE_LABEL: RELEASE_VALUE } } }))
}

/// Label patch and port patch, in the order they are applied
pub fn service_patches(service: &Service, normalized: &NormalizedPorts) -> Vec<ServicePatch> {
    let mut patches = Vec::new();
    if let Some(body) = discovery_label_patch(service) {
        patches.push(ServicePatch {
            kind: PatchKind::DiscoveryLabel,
            body,
        });
    }
    if let Some(body) = normalized.merge_patch() {
        patches.push(ServicePatch {
            kind: PatchKind::PortNames,
            body,
        });
    }
    patches
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    DiscoveryLabel,
    PortNames,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::DiscoveryLabel => "discovery_label",
            PatchKind::PortNames => "port_names",
        }
    }
}

/// A best-effort merge patch on the Service
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePatch {
    pub kind: PatchKind,
    pub body: Value,
}
