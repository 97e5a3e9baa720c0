//! Reconciliation configuration
//!
//! Values come from a read-only key lookup so that the daemon (environment
//! through the `config` crate) and the CLI (flags) share one set of defaults.

use crate::models::DEFAULT_SCRAPE_INTERVAL;
use crate::probe::ProbeConfig;
use std::time::Duration;
use tracing::warn;

/// Lookup keys understood by [`ReconcileConfig::from_lookup`]
pub mod keys {
    pub const SCRAPE_INTERVAL: &str = "scrape_interval";
    pub const SERVICE_NAMESPACES: &str = "service_namespaces";
    pub const MONITOR_NAMESPACE: &str = "monitor_namespace";
    pub const SELECTOR_NAMESPACES: &str = "selector_namespaces";
    pub const PROBE_TIMEOUT_SECS: &str = "probe_timeout_secs";
    pub const PROBE_ATTEMPTS: &str = "probe_attempts";
    pub const PROBE_BACKOFF_SECS: &str = "probe_backoff_secs";
    pub const PASS_TIMEOUT_SECS: &str = "pass_timeout_secs";
    pub const UNHEALTHY_RECHECK_SECS: &str = "unhealthy_recheck_secs";
}

const DEFAULT_SERVICE_NAMESPACES: &str = "demo";
const DEFAULT_MONITOR_NAMESPACE: &str = "default";

/// Which namespaces' Services are reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Only(Vec<String>),
}

impl NamespaceScope {
    /// Parse a comma-separated list; `*` selects every namespace
    pub fn parse(raw: &str) -> Option<Self> {
        let names = split_list(raw);
        if names.iter().any(|n| n == "*") {
            return Some(NamespaceScope::All);
        }
        if names.is_empty() {
            None
        } else {
            Some(NamespaceScope::Only(names))
        }
    }

    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            NamespaceScope::All => true,
            NamespaceScope::Only(names) => names.iter().any(|n| n == namespace),
        }
    }
}

impl std::fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceScope::All => f.write_str("*"),
            NamespaceScope::Only(names) => f.write_str(&names.join(",")),
        }
    }
}

/// Settings read during a reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Scrape interval written to every endpoint
    pub scrape_interval: String,
    /// Services outside this scope are ignored
    pub service_namespaces: NamespaceScope,
    /// Namespace ServiceMonitors are listed in and created in
    pub monitor_namespace: String,
    /// namespaceSelector override; `None` selects the Service's own namespace
    pub selector_namespaces: Option<Vec<String>>,
    pub probe: ProbeConfig,
    /// Deadline for one pass
    pub pass_timeout: Duration,
    /// How long to wait before re-probing an unhealthy Service
    pub unhealthy_recheck: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            scrape_interval: DEFAULT_SCRAPE_INTERVAL.to_string(),
            service_namespaces: NamespaceScope::Only(vec![DEFAULT_SERVICE_NAMESPACES.to_string()]),
            monitor_namespace: DEFAULT_MONITOR_NAMESPACE.to_string(),
            selector_namespaces: None,
            probe: ProbeConfig::default(),
            pass_timeout: Duration::from_secs(120),
            unhealthy_recheck: Duration::from_secs(300),
        }
    }
}

impl ReconcileConfig {
    /// Build from a key lookup, using the documented default for every
    /// absent or unparsable key
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secs = |key: &str, default: Duration| match get(key) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => Duration::from_secs(v),
                Err(_) => {
                    warn!(key = %key, value = %raw, "Ignoring non-numeric setting");
                    default
                }
            },
            None => default,
        };

        let attempts = match get(keys::PROBE_ATTEMPTS) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(v) if v > 0 => v,
                _ => {
                    warn!(key = keys::PROBE_ATTEMPTS, value = %raw, "Ignoring invalid attempt count");
                    defaults.probe.max_attempts
                }
            },
            None => defaults.probe.max_attempts,
        };

        Self {
            scrape_interval: get(keys::SCRAPE_INTERVAL).unwrap_or(defaults.scrape_interval),
            service_namespaces: get(keys::SERVICE_NAMESPACES)
                .and_then(|raw| NamespaceScope::parse(&raw))
                .unwrap_or(defaults.service_namespaces),
            monitor_namespace: get(keys::MONITOR_NAMESPACE).unwrap_or(defaults.monitor_namespace),
            selector_namespaces: get(keys::SELECTOR_NAMESPACES)
                .map(|raw| split_list(&raw))
                .filter(|names| !names.is_empty()),
            probe: ProbeConfig {
                timeout: secs(keys::PROBE_TIMEOUT_SECS, defaults.probe.timeout),
                max_attempts: attempts,
                backoff: secs(keys::PROBE_BACKOFF_SECS, defaults.probe.backoff),
                ..defaults.probe
            },
            pass_timeout: secs(keys::PASS_TIMEOUT_SECS, defaults.pass_timeout),
            unhealthy_recheck: secs(keys::UNHEALTHY_RECHECK_SECS, defaults.unhealthy_recheck),
        }
    }

    /// Whether Services in `namespace` are reconciled
    pub fn watches(&self, namespace: &str) -> bool {
        self.service_namespaces.contains(namespace)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = ReconcileConfig::from_lookup(|_| None);
        assert_eq!(config.scrape_interval, "15s");
        assert_eq!(config.monitor_namespace, "default");
        assert!(config.watches("demo"));
        assert!(!config.watches("kube-system"));
        assert!(config.selector_namespaces.is_none());
        assert_eq!(config.probe.max_attempts, 3);
        assert_eq!(config.probe.timeout, Duration::from_secs(10));
        assert_eq!(config.probe.backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = ReconcileConfig::from_lookup(lookup(&[
            (keys::SCRAPE_INTERVAL, "30s"),
            (keys::SERVICE_NAMESPACES, "glm, demo ,"),
            (keys::SELECTOR_NAMESPACES, "glm"),
            (keys::PROBE_ATTEMPTS, "5"),
            (keys::PROBE_BACKOFF_SECS, "1"),
        ]));

        assert_eq!(config.scrape_interval, "30s");
        assert_eq!(
            config.service_namespaces,
            NamespaceScope::Only(vec!["glm".to_string(), "demo".to_string()])
        );
        assert_eq!(config.selector_namespaces, Some(vec!["glm".to_string()]));
        assert_eq!(config.probe.max_attempts, 5);
        assert_eq!(config.probe.backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ReconcileConfig::from_lookup(lookup(&[
            (keys::PROBE_ATTEMPTS, "0"),
            (keys::PROBE_TIMEOUT_SECS, "ten"),
            (keys::SERVICE_NAMESPACES, " , "),
            (keys::SCRAPE_INTERVAL, "  "),
        ]));

        assert_eq!(config.probe.max_attempts, 3);
        assert_eq!(config.probe.timeout, Duration::from_secs(10));
        assert!(config.watches("demo"));
        assert_eq!(config.scrape_interval, "15s");
    }

    #[test]
    fn test_wildcard_scope() {
        let scope = NamespaceScope::parse("demo,*").unwrap();
        assert_eq!(scope, NamespaceScope::All);
        assert!(scope.contains("anything"));
        assert_eq!(scope.to_string(), "*");
        assert_eq!(NamespaceScope::parse("glm, demo").unwrap().to_string(), "glm,demo");
    }
}
