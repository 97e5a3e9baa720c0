//! ServiceMonitor controller daemon
//!
//! Wires configuration, the health/metrics HTTP API and the Service watch
//! loop from `controller-lib` into one process.

pub mod api;
pub mod config;
