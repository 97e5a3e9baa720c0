//! API server backed store

use super::ObjectStore;
use crate::error::StoreError;
use crate::models::ServiceMonitor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "servicemonitor-scale";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn monitors(&self, namespace: &str) -> Api<ServiceMonitor> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(monitor: &ServiceMonitor) -> Result<String, StoreError> {
    monitor.namespace().ok_or_else(|| StoreError::Rejected {
        code: 400,
        message: format!("ServiceMonitor {} has no namespace", monitor.name_any()),
    })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), StoreError> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.services(namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn list_monitors(&self, namespace: &str) -> Result<Vec<ServiceMonitor>, StoreError> {
        let list = self.monitors(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceMonitor>, StoreError> {
        Ok(self.monitors(namespace).get_opt(name).await?)
    }

    async fn create_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError> {
        let namespace = namespace_of(monitor)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.monitors(&namespace).create(&params, monitor).await?)
    }

    async fn update_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError> {
        let namespace = namespace_of(monitor)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .monitors(&namespace)
            .replace(&monitor.name_any(), &params, monitor)
            .await?)
    }

    async fn delete_monitor(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .monitors(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match StoreError::from(err) {
                StoreError::NotFound(_) => {
                    debug!(namespace = %namespace, name = %name, "ServiceMonitor already absent");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}
