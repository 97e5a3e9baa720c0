//! In-process object store
//!
//! Behaves like the API server where the reconciler can tell the difference:
//! resourceVersion checks on replace, AlreadyExists on create, merge patches,
//! idempotent delete. Every mutating call is recorded, and failures can be
//! queued per operation.

use super::ObjectStore;
use crate::error::StoreError;
use crate::models::ServiceMonitor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

type ObjectKey = (String, String);

/// Store operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetService,
    PatchService,
    ListMonitors,
    GetMonitor,
    CreateMonitor,
    UpdateMonitor,
    DeleteMonitor,
}

/// A mutating call as it was issued, successful or not
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    PatchService {
        namespace: String,
        name: String,
        patch: Value,
    },
    CreateMonitor {
        namespace: String,
        name: String,
    },
    UpdateMonitor {
        namespace: String,
        name: String,
    },
    DeleteMonitor {
        namespace: String,
        name: String,
    },
}

impl StoreCall {
    pub fn is_monitor_write(&self) -> bool {
        !matches!(self, StoreCall::PatchService { .. })
    }
}

#[derive(Default)]
struct State {
    services: BTreeMap<ObjectKey, Service>,
    monitors: BTreeMap<ObjectKey, ServiceMonitor>,
    calls: Vec<StoreCall>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    next_version: u64,
}

impl State {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

fn monitor_key(monitor: &ServiceMonitor) -> ObjectKey {
    key(&monitor.namespace().unwrap_or_default(), &monitor.name_any())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a Service without recording a call
    pub async fn insert_service(&self, mut service: Service) {
        let mut state = self.state.lock().await;
        service.metadata.resource_version = Some(state.bump());
        let k = key(&service.namespace().unwrap_or_default(), &service.name_any());
        state.services.insert(k, service);
    }

    pub async fn remove_service(&self, namespace: &str, name: &str) {
        self.state.lock().await.services.remove(&key(namespace, name));
    }

    /// Seed or overwrite a ServiceMonitor without recording a call
    pub async fn insert_monitor(&self, mut monitor: ServiceMonitor) {
        let mut state = self.state.lock().await;
        monitor.metadata.resource_version = Some(state.bump());
        state.monitors.insert(monitor_key(&monitor), monitor);
    }

    pub async fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .await
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    pub async fn monitor(&self, namespace: &str, name: &str) -> Option<ServiceMonitor> {
        self.state
            .lock()
            .await
            .monitors
            .get(&key(namespace, name))
            .cloned()
    }

    pub async fn monitor_count(&self) -> usize {
        self.state.lock().await.monitors.len()
    }

    /// Mutating calls issued so far
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    /// Create/update/delete calls on ServiceMonitors issued so far
    pub async fn monitor_writes(&self) -> Vec<StoreCall> {
        self.calls()
            .await
            .into_iter()
            .filter(StoreCall::is_monitor_write)
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Make the next call of `op` fail with `err`; queued failures are used in order
    pub async fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }
}

/// RFC 7396 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target) = target {
                for (field, value) in fields {
                    if value.is_null() {
                        target.remove(field);
                    } else {
                        merge_patch(target.entry(field.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn invalid(err: serde_json::Error) -> StoreError {
    StoreError::Rejected {
        code: 422,
        message: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure(StoreOp::GetService)?;
        Ok(state.services.get(&key(namespace, name)).cloned())
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::PatchService {
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: patch.clone(),
        });
        state.take_failure(StoreOp::PatchService)?;

        let k = key(namespace, name);
        let current = state
            .services
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("services/{}/{}", namespace, name)))?;
        let mut raw = serde_json::to_value(current).map_err(invalid)?;
        merge_patch(&mut raw, patch);
        let mut patched: Service = serde_json::from_value(raw).map_err(invalid)?;
        patched.metadata.resource_version = Some(state.bump());
        state.services.insert(k, patched);
        Ok(())
    }

    async fn list_monitors(&self, namespace: &str) -> Result<Vec<ServiceMonitor>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure(StoreOp::ListMonitors)?;
        Ok(state
            .monitors
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn get_monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceMonitor>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure(StoreOp::GetMonitor)?;
        Ok(state.monitors.get(&key(namespace, name)).cloned())
    }

    async fn create_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError> {
        let mut state = self.state.lock().await;
        let k = monitor_key(monitor);
        state.calls.push(StoreCall::CreateMonitor {
            namespace: k.0.clone(),
            name: k.1.clone(),
        });
        state.take_failure(StoreOp::CreateMonitor)?;

        if state.monitors.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!(
                "servicemonitors/{}/{}",
                k.0, k.1
            )));
        }
        let mut created = monitor.clone();
        created.metadata.resource_version = Some(state.bump());
        state.monitors.insert(k, created.clone());
        Ok(created)
    }

    async fn update_monitor(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor, StoreError> {
        let mut state = self.state.lock().await;
        let k = monitor_key(monitor);
        state.calls.push(StoreCall::UpdateMonitor {
            namespace: k.0.clone(),
            name: k.1.clone(),
        });
        state.take_failure(StoreOp::UpdateMonitor)?;

        let live_version = state
            .monitors
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("servicemonitors/{}/{}", k.0, k.1)))?
            .metadata
            .resource_version
            .clone();
        if let Some(expected) = monitor.metadata.resource_version.as_ref() {
            if live_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "servicemonitors/{}/{}: resourceVersion {} is stale",
                    k.0, k.1, expected
                )));
            }
        }

        let mut updated = monitor.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.monitors.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_monitor(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::DeleteMonitor {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        state.take_failure(StoreOp::DeleteMonitor)?;
        state.monitors.remove(&key(namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceMonitorSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn monitor(name: &str) -> ServiceMonitor {
        ServiceMonitor {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ServiceMonitorSpec::default(),
        }
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_patch(&mut target, &json!({"a": {"b": null, "e": 3}, "d": [3]}));

        assert_eq!(target, json!({"a": {"c": 2, "e": 3}, "d": [3]}));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create_monitor(&monitor("foo")).await.unwrap();

        let mut first = created.clone();
        first.spec.extra.insert("jobLabel".into(), json!("app"));
        store.update_monitor(&first).await.unwrap();

        let err = store.update_monitor(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let store = InMemoryStore::new();
        store.create_monitor(&monitor("foo")).await.unwrap();

        let err = store.create_monitor(&monitor("foo")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds_and_is_recorded() {
        let store = InMemoryStore::new();

        store.delete_monitor("default", "missing").await.unwrap();

        assert_eq!(
            store.calls().await,
            vec![StoreCall::DeleteMonitor {
                namespace: "default".into(),
                name: "missing".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = InMemoryStore::new();
        store
            .fail_next(StoreOp::ListMonitors, StoreError::Transient("reset".into()))
            .await;

        assert!(store.list_monitors("default").await.is_err());
        assert!(store.list_monitors("default").await.is_ok());
    }
}
