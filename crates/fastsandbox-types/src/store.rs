//! The cluster's declarative object store, treated as an external
//! collaborator (`spec.md` §1): a generic reliable key-value store with
//! watch and conflict-detected update. Only the trait and an in-memory test
//! double live here — a production implementation (etcd, the Kubernetes
//! API server, or similar) is out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::model::Sandbox;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("sandbox {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("sandbox {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("conflict updating {namespace}/{name}: resource version {given} is stale (current {current})")]
    Conflict {
        namespace: String,
        name: String,
        given: u64,
        current: u64,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A `Sandbox` plus the store-assigned bookkeeping needed for
/// conflict-detected updates.
#[derive(Debug, Clone)]
pub struct StoredSandbox {
    pub sandbox: Sandbox,
    pub resource_version: u64,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Created(StoredSandbox),
    Updated(StoredSandbox),
    Deleted { namespace: String, name: String },
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StoredSandbox>, StoreError>;
    async fn list(&self, namespace: &str) -> Result<Vec<StoredSandbox>, StoreError>;
    async fn list_all(&self) -> Result<Vec<StoredSandbox>, StoreError>;
    /// Assigns `uid` and an initial resource version. Only `spec` is
    /// durable after this call returns — callers relying on `status` being
    /// visible atomically with creation must use the `allocation`
    /// annotation handoff (`spec.md` §4.6), not this call.
    async fn create(&self, sandbox: Sandbox) -> Result<StoredSandbox, StoreError>;
    /// Conflict-detected update: fails with `StoreError::Conflict` if
    /// `sandbox.resource_version` no longer matches the stored version.
    async fn update(&self, sandbox: StoredSandbox) -> Result<StoredSandbox, StoreError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    async fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// In-memory `DurableStore` used by tests and by example wiring. Never a
/// production deliverable — see `spec.md` §1's Explicitly-out-of-scope list.
pub struct InMemoryStore {
    records: RwLock<HashMap<(String, String), StoredSandbox>>,
    events: broadcast::Sender<StoreEvent>,
    next_uid: std::sync::atomic::AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            events: tx,
            next_uid: std::sync::atomic::AtomicU64::new(1),
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            records: RwLock::new(HashMap::new()),
            events: tx,
            next_uid: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StoredSandbox>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<StoredSandbox>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.sandbox.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<StoredSandbox>, StoreError> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn create(&self, mut sandbox: Sandbox) -> Result<StoredSandbox, StoreError> {
        let key = (sandbox.namespace.clone(), sandbox.name.clone());
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                namespace: sandbox.namespace,
                name: sandbox.name,
            });
        }
        let uid = self
            .next_uid
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        sandbox.uid = Some(format!("uid-{uid}"));
        let stored = StoredSandbox {
            sandbox,
            resource_version: 1,
        };
        records.insert(key, stored.clone());
        let _ = self.events.send(StoreEvent::Created(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, sandbox: StoredSandbox) -> Result<StoredSandbox, StoreError> {
        let key = (
            sandbox.sandbox.namespace.clone(),
            sandbox.sandbox.name.clone(),
        );
        let mut records = self.records.write().await;
        let current = records.get(&key).ok_or_else(|| StoreError::NotFound {
            namespace: key.0.clone(),
            name: key.1.clone(),
        })?;
        if current.resource_version != sandbox.resource_version {
            return Err(StoreError::Conflict {
                namespace: key.0,
                name: key.1,
                given: sandbox.resource_version,
                current: current.resource_version,
            });
        }
        let mut next = sandbox;
        next.resource_version += 1;
        records.insert(key, next.clone());
        let _ = self.events.send(StoreEvent::Updated(next.clone()));
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let mut records = self.records.write().await;
        if records.remove(&key).is_none() {
            return Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let _ = self.events.send(StoreEvent::Deleted {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
