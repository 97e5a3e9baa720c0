//! Object store seam
//!
//! Everything the reconciler reads or writes in the cluster goes through
//! [`ObjectStore`]. [`KubeStore`] talks to the API server; [`InMemoryStore`]
//! backs tests.

mod cluster;
mod memory;

pub use self::cluster::KubeStore;
pub use self::memory::{InMemoryStore, StoreCall, StoreOp};

use crate::error::StoreError;
use crate::models::ServiceMonitor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use serde_json::Value;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the Service does not exist
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, StoreError>;

    /// Apply a JSON merge patch to a Service
    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), StoreError>;

    /// All ServiceMonitors in `namespace`
    async fn list_monitors(&self, namespace: &str) -> Result<Vec<ServiceMonitor>, StoreError>;

    async fn get_monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceMonitor>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] when the name is taken
    async fn create_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError>;

    /// Replace guarded by `metadata.resourceVersion`; a stale version fails
    /// with [`StoreError::Conflict`]
    async fn update_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError>;

    /// Deleting an absent monitor succeeds
    async fn delete_monitor(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
