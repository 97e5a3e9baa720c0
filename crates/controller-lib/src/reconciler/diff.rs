//! Field-by-field comparison of a live ServiceMonitor against the desired one
//!
//! Only the selector and the endpoint list are owned by the controller.
//! Metadata, namespaceSelector and unmodeled fields never trigger an update.

use crate::builder::DesiredMonitor;
use crate::models::{Endpoint, ServiceMonitor};
use crate::selector::has_expressions;

/// Which owned fields of a live monitor differ from the desired spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorDiff {
    pub selector: bool,
    pub endpoints: bool,
}

impl MonitorDiff {
    pub fn compute(desired: &DesiredMonitor, live: &ServiceMonitor) -> Self {
        let live_selector = &live.spec.selector;
        let selector = has_expressions(live_selector)
            || live_selector.match_labels.clone().unwrap_or_default() != desired.selector;

        let endpoints = match live.spec.endpoints.as_slice() {
            [only] => !endpoint_matches(only, &desired.endpoint),
            _ => true,
        };

        Self {
            selector,
            endpoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.selector && !self.endpoints
    }

    /// Names of the differing fields, for logs
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.selector {
            fields.push("selector");
        }
        if self.endpoints {
            fields.push("endpoints");
        }
        fields
    }

    /// Copy of `live` with only the differing fields replaced
    ///
    /// The replacement endpoint keeps the unmodeled settings (scheme,
    /// relabelings, ...) of the first live endpoint.
    pub fn apply(&self, desired: &DesiredMonitor, live: &ServiceMonitor) -> ServiceMonitor {
        let mut updated = live.clone();
        if self.selector {
            updated.spec.selector = desired.label_selector();
        }
        if self.endpoints {
            let extra = live
                .spec
                .endpoints
                .first()
                .map(|e| e.extra.clone())
                .unwrap_or_default();
            updated.spec.endpoints = vec![Endpoint {
                extra,
                ..desired.endpoint.clone()
            }];
        }
        updated
    }
}

fn endpoint_matches(live: &Endpoint, desired: &Endpoint) -> bool {
    live.port == desired.port
        && live.effective_path() == desired.effective_path()
        && live.interval == desired.interval
}
