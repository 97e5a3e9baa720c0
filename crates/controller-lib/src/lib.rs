//! Controller library for ServiceMonitor lifecycle management
//!
//! This crate provides the core functionality for:
//! - Service port-name normalization and discovery labels
//! - Metrics endpoint health probing
//! - Label selector matching and desired ServiceMonitor derivation
//! - Stateless, idempotent reconciliation against the cluster
//! - Health checks and observability

pub mod builder;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod normalizer;
pub mod observability;
pub mod probe;
pub mod reconciler;
pub mod selector;
pub mod store;

pub use config::{NamespaceScope, ReconcileConfig};
pub use error::{ReconcileError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use reconciler::{Decision, Plan, ReconcileOutcome, Reconciler};
