//! Desired ServiceMonitor derivation
//!
//! A pure function of the normalized Service and the configuration, so two
//! passes over an unchanged Service always compare against the same spec.

use crate::config::ReconcileConfig;
use crate::models::{
    app_value, Endpoint, MonitorKey, NamespaceSelector, ServiceKey, ServiceMonitor,
    ServiceMonitorSpec, APP_LABEL, METRICS_PATH, OWNER_ANNOTATION, RELEASE_LABEL, RELEASE_VALUE,
};
use crate::normalizer::NormalizedPorts;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

/// The fields this controller owns on a ServiceMonitor
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredMonitor {
    pub key: MonitorKey,
    pub owner: ServiceKey,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub namespace_selector: Vec<String>,
    pub endpoint: Endpoint,
}

impl DesiredMonitor {
    /// Port name the single endpoint scrapes
    pub fn port(&self) -> &str {
        self.endpoint.port.as_deref().unwrap_or_default()
    }

    pub fn interval(&self) -> &str {
        self.endpoint.interval.as_deref().unwrap_or_default()
    }

    pub fn label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(self.selector.clone()),
            match_expressions: None,
        }
    }

    /// Full object for a create call
    pub fn to_resource(&self) -> ServiceMonitor {
        let metadata = ObjectMeta {
            name: Some(self.key.name.clone()),
            namespace: Some(self.key.namespace.clone()),
            labels: Some(self.labels.clone()),
            annotations: Some(BTreeMap::from([(
                OWNER_ANNOTATION.to_string(),
                self.owner.owner_ref(),
            )])),
            ..Default::default()
        };

        ServiceMonitor {
            metadata,
            spec: ServiceMonitorSpec {
                selector: self.label_selector(),
                namespace_selector: Some(NamespaceSelector {
                    any: false,
                    match_names: self.namespace_selector.clone(),
                }),
                endpoints: vec![self.endpoint.clone()],
                extra: BTreeMap::new(),
            },
        }
    }
}

/// Derive the desired ServiceMonitor for `service`
///
/// `normalized` must come from the same Service; its derived name becomes
/// the endpoint port.
pub fn build_desired(
    service: &Service,
    key: &ServiceKey,
    normalized: &NormalizedPorts,
    config: &ReconcileConfig,
) -> DesiredMonitor {
    let app = app_value(service);

    let discovery = BTreeMap::from([
        (RELEASE_LABEL.to_string(), RELEASE_VALUE.to_string()),
        (APP_LABEL.to_string(), app.clone()),
    ]);

    let namespace_selector = config
        .selector_namespaces
        .clone()
        .unwrap_or_else(|| vec![key.namespace.clone()]);

    DesiredMonitor {
        key: MonitorKey {
            namespace: config.monitor_namespace.clone(),
            name: app,
        },
        owner: key.clone(),
        labels: discovery.clone(),
        selector: discovery,
        namespace_selector,
        endpoint: Endpoint {
            port: Some(normalized.derived_name.clone()),
            path: Some(METRICS_PATH.to_string()),
            interval: Some(config.scrape_interval.clone()),
            extra: BTreeMap::new(),
        },
    }
}
