//! Controller configuration

use anyhow::{Context, Result};
use controller_lib::config::{keys, ReconcileConfig};
use serde::Deserialize;
use std::collections::HashMap;

/// Environment prefix, e.g. `SMSCALE_SCRAPE_INTERVAL`
pub const ENV_PREFIX: &str = "SMSCALE";

/// Unprefixed variable names read when the prefixed ones are absent
pub const LEGACY_VARS: &[(&str, &str)] = &[
    ("Interval", keys::SCRAPE_INTERVAL),
    ("ServiceNamespaces", keys::SERVICE_NAMESPACES),
];

/// Process-level settings
#[derive(Debug, Clone, Deserialize)]
struct ServerSettings {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    api_port: u16,

    /// Identifies this replica in logs
    #[serde(default = "default_controller_id")]
    controller_id: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_controller_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "smscale-controller".to_string())
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub api_port: u16,
    pub controller_id: String,
    pub reconcile: ReconcileConfig,
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let legacy: HashMap<String, String> = LEGACY_VARS
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| (key.to_string(), v)))
            .collect();

        Self::from_sources(config::Environment::with_prefix(ENV_PREFIX), legacy)
    }

    /// Prefixed environment wins over legacy values, which win over defaults
    pub fn from_sources(
        environment: config::Environment,
        legacy: HashMap<String, String>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        for (key, value) in legacy {
            builder = builder
                .set_default(key.as_str(), value)
                .context("Invalid legacy setting")?;
        }
        let settings = builder
            .add_source(environment)
            .build()
            .context("Failed to read controller settings")?;

        let server: ServerSettings = settings
            .clone()
            .try_deserialize()
            .context("Invalid controller settings")?;
        let reconcile = ReconcileConfig::from_lookup(|key| settings.get_string(key).ok());

        Ok(Self {
            api_port: server.api_port,
            controller_id: server.controller_id,
            reconcile,
        })
    }
}
