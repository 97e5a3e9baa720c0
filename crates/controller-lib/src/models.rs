//! Core data models for the ServiceMonitor controller
//!
//! The `ServiceMonitor` custom resource is modeled only as far as this
//! controller reads or writes it. Everything else in `spec` and in each
//! endpoint round-trips untouched through the flattened `extra` maps.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Discovery label key shared by Services and ServiceMonitors
pub const RELEASE_LABEL: &str = "release";
/// Discovery label value the Prometheus instance selects on
pub const RELEASE_VALUE: &str = "kube-prometheus-stack";
/// Application label used for names, selectors and port names
pub const APP_LABEL: &str = "app";
/// Annotation recording which Service a ServiceMonitor was created for
pub const OWNER_ANNOTATION: &str = "servicemonitor-scale.io/owner";
/// Path scraped on every monitored endpoint
pub const METRICS_PATH: &str = "/metrics";
/// Scrape interval when none is configured
pub const DEFAULT_SCRAPE_INTERVAL: &str = "15s";

/// Prometheus operator ServiceMonitor (`monitoring.coreos.com/v1`)
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    /// Fields this controller does not manage (jobLabel, targetLabels, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Namespaces a ServiceMonitor selects Services from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub any: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}

/// A single scrape endpoint of a ServiceMonitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// scheme, tlsConfig, relabelings and the rest
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Endpoint {
    /// Path the scraper will actually hit (the operator defaults to /metrics)
    pub fn effective_path(&self) -> &str {
        self.path.as_deref().unwrap_or(METRICS_PATH)
    }
}

/// Identity of a Service: the unit a reconciliation pass works on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Service object; `None` when it has no namespace
    pub fn from_service(service: &Service) -> Option<Self> {
        let namespace = service.namespace()?;
        Some(Self::new(namespace, service.name_any()))
    }

    /// Value stored in the owner annotation of monitors created for this Service
    pub fn owner_ref(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ServiceKey {
    type Err = String;

    /// Parses `namespace/name`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(format!("expected <namespace>/<name>, got '{}'", s)),
        }
    }
}

/// Identity of a ServiceMonitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The `app` label of a Service, falling back to its name
pub fn app_value(service: &Service) -> String {
    service
        .labels()
        .get(APP_LABEL)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| service.name_any())
}
