//! Sandbox reconcile loop (`spec.md` §4.7): the Controller's Strong-mode
//! path. Watches the `DurableStore` for create/update/delete events and
//! drives each `Sandbox` through its phase state machine, using the
//! `cleanup` finalizer to guarantee Agent-side teardown happens before the
//! durable record disappears.

use std::sync::Arc;
use std::time::Duration;

use fastsandbox_types::model::{Sandbox, SandboxPhase};
use fastsandbox_types::store::{DurableStore, StoreEvent, StoredSandbox};
use tracing::{error, info, warn};

use crate::agent_client::AgentClient;
use crate::registry::{AllocationRequest, Registry, RegistryError};
use crate::sandbox_id::generate_id;

/// Fallback re-list interval in case a watch event is dropped.
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

pub struct Reconciler {
    store: Arc<dyn DurableStore>,
    registry: Arc<Registry>,
    agent_port: u16,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DurableStore>, registry: Arc<Registry>) -> Self {
        Self::with_agent_port(store, registry, 5758)
    }

    pub fn with_agent_port(store: Arc<dyn DurableStore>, registry: Arc<Registry>, agent_port: u16) -> Self {
        Self {
            store,
            registry,
            agent_port,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.store.watch().await;
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(StoreEvent::Created(stored)) | Ok(StoreEvent::Updated(stored)) => {
                            self.reconcile_one(stored).await;
                        }
                        Ok(StoreEvent::Deleted { namespace, name }) => {
                            debug_deleted(&namespace, &name);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "reconciler lagged behind store events, resyncing");
                            self.resync_all().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = resync.tick() => {
                    self.resync_all().await;
                }
            }
        }
    }

    async fn resync_all(&self) {
        match self.store.list_all().await {
            Ok(all) => {
                for stored in all {
                    self.reconcile_one(stored).await;
                }
            }
            Err(e) => error!(error = %e, "resync list_all failed"),
        }
    }

    /// Drive one sandbox one step forward. Re-entrant and idempotent: every
    /// branch either makes progress or is a no-op, so re-running it after a
    /// crash is always safe.
    async fn reconcile_one(&self, stored: StoredSandbox) {
        let StoredSandbox {
            mut sandbox,
            resource_version,
        } = stored;
        let key = sandbox.key();

        if sandbox.is_being_deleted() {
            self.reconcile_deletion(sandbox, resource_version).await;
            return;
        }

        if !sandbox.has_finalizer() {
            sandbox.add_finalizer();
            if let Err(e) = self.commit(sandbox, resource_version).await {
                warn!(sandbox = %key, error = %e, "failed to add finalizer");
            }
            return;
        }

        if sandbox.is_expired(now_unix_nano()) && !sandbox.status.phase.is_terminal() {
            self.reconcile_expiration(sandbox, resource_version).await;
            return;
        }

        if self.needs_reset(&sandbox) {
            self.reconcile_reset(sandbox, resource_version).await;
            return;
        }

        match sandbox.status.phase {
            SandboxPhase::Pending => self.reconcile_pending(sandbox, resource_version).await,
            SandboxPhase::Bound | SandboxPhase::Running => {
                self.reconcile_bound(sandbox, resource_version).await
            }
            SandboxPhase::Failed => self.reconcile_failed(sandbox, resource_version).await,
            SandboxPhase::Lost => self.reconcile_lost(sandbox, resource_version).await,
            SandboxPhase::Terminating | SandboxPhase::Expired => {
                // Terminal or awaiting deletion — nothing more to drive until
                // the client deletes it or a later event changes the spec.
            }
        }
    }

    /// A client-requested reset (`spec.md` §4.7 pt.4) bumps
    /// `spec.reset_revision` past what the Controller last accepted. The
    /// sandbox is torn down on its current Agent and rescheduled fresh,
    /// the same way an `AutoRecreate` failure is.
    fn needs_reset(&self, sandbox: &Sandbox) -> bool {
        match sandbox.spec.reset_revision {
            Some(requested) => Some(requested) != sandbox.status.accepted_reset_revision,
            None => false,
        }
    }

    async fn reconcile_reset(&self, mut sandbox: Sandbox, resource_version: u64) {
        let key = sandbox.key();
        if let Some(agent_id) = sandbox.status.assigned_pod.clone() {
            if let Some(handle) = self.registry.get(&agent_id).await {
                let agent_info = handle.lock().await.clone();
                if let Some(sandbox_id) = sandbox.status.sandbox_id.clone() {
                    let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
                    if let Err(e) = client.delete_sandbox(&sandbox_id).await {
                        warn!(sandbox = %key, error = %e, "agent delete failed during reset, will retry");
                        return;
                    }
                }
            }
            self.registry
                .release(&agent_id, &sandbox.spec.exposed_ports)
                .await;
        }

        sandbox.status.accepted_reset_revision = sandbox.spec.reset_revision;
        sandbox.status.phase = SandboxPhase::Pending;
        sandbox.status.assigned_pod = None;
        sandbox.status.node_name = None;
        sandbox.status.sandbox_id = None;
        sandbox.status.endpoints.clear();
        info!(sandbox = %key, revision = ?sandbox.status.accepted_reset_revision, "sandbox reset accepted, rescheduling");
        let _ = self.commit(sandbox, resource_version).await;
    }

    async fn reconcile_expiration(&self, mut sandbox: Sandbox, resource_version: u64) {
        let key = sandbox.key();
        if let Some(agent_id) = sandbox.status.assigned_pod.clone() {
            if let Some(handle) = self.registry.get(&agent_id).await {
                let agent_info = handle.lock().await.clone();
                if let Some(sandbox_id) = sandbox.status.sandbox_id.clone() {
                    let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
                    if let Err(e) = client.delete_sandbox(&sandbox_id).await {
                        warn!(sandbox = %key, error = %e, "agent delete failed while expiring, will retry");
                        return;
                    }
                }
            }
            self.registry
                .release(&agent_id, &sandbox.spec.exposed_ports)
                .await;
        }

        sandbox.status.phase = SandboxPhase::Expired;
        sandbox.status.assigned_pod = None;
        sandbox.status.sandbox_id = None;
        sandbox.status.endpoints.clear();
        info!(sandbox = %key, "sandbox expired, agent resources released");
        if let Err(e) = self.commit(sandbox, resource_version).await {
            warn!(sandbox = %key, error = %e, "failed to mark sandbox expired");
        }
    }

    /// A `Lost` sandbox (owning agent vanished, `failure_policy: Manual`)
    /// isn't a dead end: every reconcile retries allocation onto a fresh
    /// agent, the same way a new `Pending` sandbox would be scheduled.
    async fn reconcile_lost(&self, mut sandbox: Sandbox, resource_version: u64) {
        let key = sandbox.key();
        let req = AllocationRequest {
            pool_name: &sandbox.spec.pool_ref,
            ports: &sandbox.spec.exposed_ports,
            image: &sandbox.spec.image,
        };
        match self.registry.select_agent(&req).await {
            Ok(_) => {
                sandbox.status.phase = SandboxPhase::Pending;
                sandbox.status.assigned_pod = None;
                sandbox.status.sandbox_id = None;
                sandbox.status.endpoints.clear();
                info!(sandbox = %key, "capacity available again, rescheduling lost sandbox");
                let _ = self.commit(sandbox, resource_version).await;
            }
            Err(_) => {
                debug_no_capacity(&key);
            }
        }
    }

    async fn reconcile_pending(&self, mut sandbox: Sandbox, resource_version: u64) {
        let key = sandbox.key();
        let req = AllocationRequest {
            pool_name: &sandbox.spec.pool_ref,
            ports: &sandbox.spec.exposed_ports,
            image: &sandbox.spec.image,
        };

        let agent_id = match self.registry.select_agent(&req).await {
            Ok(id) => id,
            Err(RegistryError::NoCapacity) | Err(RegistryError::PortConflict) => {
                debug_no_capacity(&key);
                return;
            }
            Err(RegistryError::UnknownAgent(_)) => unreachable!("select_agent never returns this"),
        };

        if let Err(e) = self
            .registry
            .reserve(&agent_id, &sandbox.spec.exposed_ports, &sandbox.spec.image)
            .await
        {
            warn!(sandbox = %key, agent_id, error = %e, "lost the allocation race, retrying next event");
            return;
        }

        let sandbox_id = sandbox
            .status
            .sandbox_id
            .clone()
            .unwrap_or_else(|| generate_id(crate::sandbox_id::SANDBOX_PREFIX));

        let agent_info = match self.registry.get(&agent_id).await {
            Some(h) => h.lock().await.clone(),
            None => {
                self.registry.release(&agent_id, &sandbox.spec.exposed_ports).await;
                warn!(sandbox = %key, agent_id, "agent vanished mid-reservation");
                return;
            }
        };

        let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
        let claim_uid = sandbox.uid.clone().unwrap_or_default();
        let create_req = crate::agent_client::CreateRequest {
            namespace: &sandbox.namespace,
            name: &sandbox.name,
            sandbox_id: &sandbox_id,
            claim_uid: &claim_uid,
            image: &sandbox.spec.image,
            command: &sandbox.spec.command,
            args: &sandbox.spec.args,
            env: &sandbox.spec.env,
            exposed_ports: &sandbox.spec.exposed_ports,
        };

        match client.create_sandbox(&create_req).await {
            Ok(resp) => {
                sandbox.status.phase = SandboxPhase::Bound;
                sandbox.status.assigned_pod = Some(agent_info.id.clone());
                sandbox.status.node_name = Some(agent_info.node_name.clone());
                sandbox.status.sandbox_id = Some(sandbox_id);
                sandbox.status.endpoints = resp.endpoints;
                info!(sandbox = %key, agent_id = %agent_info.id, "sandbox bound to agent");
                if let Err(e) = self.commit(sandbox, resource_version).await {
                    warn!(sandbox = %key, error = %e, "failed to commit bound status");
                    self.registry
                        .release(&agent_id, &agent_info_ports(&agent_info))
                        .await;
                }
            }
            Err(e) => {
                error!(sandbox = %key, agent_id, error = %e, "agent create failed");
                self.registry
                    .release(&agent_id, &agent_info_ports(&agent_info))
                    .await;
                sandbox.status.phase = SandboxPhase::Failed;
                let _ = self.commit(sandbox, resource_version).await;
            }
        }
    }

    async fn reconcile_bound(&self, sandbox: Sandbox, _resource_version: u64) {
        use fastsandbox_types::model::FailurePolicy;

        let key = sandbox.key();
        let Some(agent_id) = sandbox.status.assigned_pod.clone() else {
            warn!(sandbox = %key, "bound sandbox has no assigned agent, will retry");
            return;
        };

        if self.registry.get(&agent_id).await.is_none() {
            // Agent-lost path: the control loop already evicted it from the
            // Registry, so there's no Agent left to call. resource_version
            // was consumed by caller already if stale; refetch to be safe.
            let mut sandbox = sandbox;
            let Ok(Some(latest)) = self.store.get(&sandbox.namespace, &sandbox.name).await else {
                return;
            };

            if sandbox.spec.failure_policy == FailurePolicy::AutoRecreate {
                sandbox.status.phase = SandboxPhase::Pending;
                sandbox.status.assigned_pod = None;
                sandbox.status.sandbox_id = None;
                sandbox.status.endpoints.clear();
                info!(sandbox = %key, agent_id, "owning agent lost, auto-recreating on a new agent");
            } else {
                sandbox.status.phase = SandboxPhase::Lost;
                warn!(sandbox = %key, agent_id, "owning agent lost, marking sandbox Lost");
            }
            let _ = self.commit(sandbox, latest.resource_version).await;
        }
    }

    async fn reconcile_failed(&self, sandbox: Sandbox, resource_version: u64) {
        use fastsandbox_types::model::FailurePolicy;
        if sandbox.spec.failure_policy != FailurePolicy::AutoRecreate {
            return;
        }
        let key = sandbox.key();
        if let Some(agent_id) = sandbox.status.assigned_pod.clone() {
            self.registry
                .release(&agent_id, &sandbox.spec.exposed_ports)
                .await;
        }
        let mut sandbox = sandbox;
        sandbox.status.phase = SandboxPhase::Pending;
        sandbox.status.assigned_pod = None;
        sandbox.status.sandbox_id = None;
        sandbox.status.endpoints.clear();
        info!(sandbox = %key, "auto-recreating failed sandbox");
        let _ = self.commit(sandbox, resource_version).await;
    }

    async fn reconcile_deletion(&self, mut sandbox: Sandbox, resource_version: u64) {
        let key = sandbox.key();
        if !sandbox.has_finalizer() {
            // Nothing left for us to clean up; let the store finish the delete.
            return;
        }

        if let Some(agent_id) = sandbox.status.assigned_pod.clone() {
            if let Some(handle) = self.registry.get(&agent_id).await {
                let agent_info = handle.lock().await.clone();
                let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
                if let Some(sandbox_id) = sandbox.status.sandbox_id.clone() {
                    if let Err(e) = client.delete_sandbox(&sandbox_id).await {
                        warn!(sandbox = %key, error = %e, "agent delete failed, will retry");
                        return;
                    }
                }
                self.registry
                    .release(&agent_id, &sandbox.spec.exposed_ports)
                    .await;
            }
        }

        sandbox.remove_finalizer();
        info!(sandbox = %key, "finalizer cleared, store will complete deletion");
        let _ = self.commit(sandbox, resource_version).await;
    }

    async fn commit(
        &self,
        sandbox: Sandbox,
        resource_version: u64,
    ) -> Result<(), fastsandbox_types::store::StoreError> {
        self.store
            .update(StoredSandbox {
                sandbox,
                resource_version,
            })
            .await
            .map(|_| ())
    }
}

fn agent_info_ports(info: &fastsandbox_types::model::AgentInfo) -> Vec<u16> {
    info.used_ports.iter().copied().collect()
}

fn now_unix_nano() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

fn debug_no_capacity(key: &str) {
    tracing::debug!(sandbox = %key, "no agent capacity yet, will retry on next event");
}

fn debug_deleted(namespace: &str, name: &str) {
    tracing::debug!(namespace, name, "sandbox fully deleted from store");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastsandbox_types::model::SandboxSpec;
    use fastsandbox_types::store::InMemoryStore;
    use std::collections::HashSet;

    fn spec(pool: &str) -> SandboxSpec {
        SandboxSpec {
            image: "alpine".to_string(),
            command: vec![],
            args: vec![],
            env: Default::default(),
            working_dir: String::new(),
            exposed_ports: vec![],
            pool_ref: pool.to_string(),
            expire_time_unix_nano: None,
            failure_policy: Default::default(),
            recovery_timeout_seconds: 0,
            reset_revision: None,
        }
    }

    #[tokio::test]
    async fn reconcile_adds_finalizer_first() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let stored = store
            .create(Sandbox::new("default", "a", spec("p1")))
            .await
            .unwrap();
        assert!(!stored.sandbox.has_finalizer());

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "a").await.unwrap().unwrap();
        assert!(refreshed.sandbox.has_finalizer());
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
    }

    #[tokio::test]
    async fn reconcile_pending_without_capacity_stays_pending() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "a", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "a").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
    }

    #[tokio::test]
    async fn reconcile_deletion_without_finalizer_is_noop() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "a", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.deletion_timestamp = Some(chrono::Utc::now());
        let stored = store.update(stored).await.unwrap();

        // Should not panic and should not touch the store further.
        reconciler.reconcile_one(stored).await;
    }

    #[tokio::test]
    async fn reconcile_bound_with_lost_agent_marks_sandbox_lost() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "c", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Running;
        stored.sandbox.status.assigned_pod = Some("g1".to_string());
        let stored = store.update(stored).await.unwrap();

        // g1 was never registered (or was already evicted by the control
        // loop), so the sandbox it's bound to should flip to Lost.
        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Lost);
    }

    #[tokio::test]
    async fn reconcile_failed_auto_recreate_resets_to_pending() {
        use fastsandbox_types::model::FailurePolicy;

        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry
            .upsert(fastsandbox_types::model::AgentInfo {
                id: "g1".to_string(),
                namespace: "default".to_string(),
                pod_ip: "127.0.0.1".to_string(),
                node_name: "node-1".to_string(),
                pool_name: "p1".to_string(),
                capacity: 4,
                allocated: 1,
                used_ports: HashSet::new(),
                images: HashSet::new(),
                sandbox_statuses: Default::default(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;
        let reconciler = Reconciler::new(store.clone(), registry.clone());

        let mut recreate_spec = spec("p1");
        recreate_spec.failure_policy = FailurePolicy::AutoRecreate;
        let mut stored = store
            .create(Sandbox::new("default", "c", recreate_spec))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Failed;
        stored.sandbox.status.assigned_pod = Some("g1".to_string());
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
        assert!(refreshed.sandbox.status.assigned_pod.is_none());
    }

    #[tokio::test]
    async fn reconcile_failed_manual_policy_stays_failed() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "c", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Failed;
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Failed);
    }

    #[tokio::test]
    async fn reconcile_bound_with_lost_agent_and_auto_recreate_reschedules() {
        use fastsandbox_types::model::FailurePolicy;

        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut recreate_spec = spec("p1");
        recreate_spec.failure_policy = FailurePolicy::AutoRecreate;
        let mut stored = store
            .create(Sandbox::new("default", "c", recreate_spec))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Running;
        stored.sandbox.status.assigned_pod = Some("g1".to_string());
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
        assert!(refreshed.sandbox.status.assigned_pod.is_none());
    }

    #[tokio::test]
    async fn reconcile_lost_reschedules_once_capacity_returns() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry
            .upsert(fastsandbox_types::model::AgentInfo {
                id: "g2".to_string(),
                namespace: "default".to_string(),
                pod_ip: "127.0.0.1".to_string(),
                node_name: "node-1".to_string(),
                pool_name: "p1".to_string(),
                capacity: 4,
                allocated: 0,
                used_ports: HashSet::new(),
                images: HashSet::new(),
                sandbox_statuses: Default::default(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "c", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Lost;
        stored.sandbox.status.assigned_pod = Some("gone".to_string());
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
        assert!(refreshed.sandbox.status.assigned_pod.is_none());
    }

    #[tokio::test]
    async fn reconcile_lost_stays_lost_without_capacity() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut stored = store
            .create(Sandbox::new("default", "c", spec("p1")))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Lost;
        stored.sandbox.status.assigned_pod = Some("gone".to_string());
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Lost);
    }

    #[tokio::test]
    async fn reconcile_expiration_releases_agent_resources() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry
            .upsert(fastsandbox_types::model::AgentInfo {
                id: "g1".to_string(),
                namespace: "default".to_string(),
                pod_ip: "127.0.0.1".to_string(),
                node_name: "node-1".to_string(),
                pool_name: "p1".to_string(),
                capacity: 4,
                allocated: 1,
                used_ports: HashSet::from([8080]),
                images: HashSet::new(),
                sandbox_statuses: Default::default(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;
        let reconciler = Reconciler::new(store.clone(), registry.clone());

        let mut expiring_spec = spec("p1");
        expiring_spec.exposed_ports = vec![8080];
        expiring_spec.expire_time_unix_nano = Some(1);
        let mut stored = store
            .create(Sandbox::new("default", "c", expiring_spec))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Running;
        stored.sandbox.status.assigned_pod = Some("g1".to_string());
        // sandbox_id left unset: no agent pod is actually listening in this
        // test, so skipping the delete_sandbox RPC keeps the assertion
        // focused on resource release rather than network behavior.
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Expired);
        assert!(refreshed.sandbox.status.assigned_pod.is_none());

        let handle = registry.get("g1").await.unwrap();
        let info = handle.lock().await;
        assert_eq!(info.allocated, 0);
        assert!(!info.used_ports.contains(&8080));
    }

    #[tokio::test]
    async fn reconcile_reset_reschedules_with_no_agent_assigned() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let reconciler = Reconciler::new(store.clone(), registry);

        let mut reset_spec = spec("p1");
        reset_spec.reset_revision = Some(1);
        let mut stored = store
            .create(Sandbox::new("default", "c", reset_spec))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Pending;
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
        assert_eq!(refreshed.sandbox.status.accepted_reset_revision, Some(1));
    }

    #[tokio::test]
    async fn reconcile_reset_releases_bound_agent_before_rescheduling() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry
            .upsert(fastsandbox_types::model::AgentInfo {
                id: "g1".to_string(),
                namespace: "default".to_string(),
                pod_ip: "127.0.0.1".to_string(),
                node_name: "node-1".to_string(),
                pool_name: "p1".to_string(),
                capacity: 4,
                allocated: 1,
                used_ports: HashSet::from([8080]),
                images: HashSet::new(),
                sandbox_statuses: Default::default(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;
        let reconciler = Reconciler::new(store.clone(), registry.clone());

        let mut reset_spec = spec("p1");
        reset_spec.exposed_ports = vec![8080];
        reset_spec.reset_revision = Some(2);
        let mut stored = store
            .create(Sandbox::new("default", "c", reset_spec))
            .await
            .unwrap();
        stored.sandbox.add_finalizer();
        stored.sandbox.status.phase = SandboxPhase::Running;
        stored.sandbox.status.assigned_pod = Some("g1".to_string());
        // sandbox_id left unset so the reset path skips the delete_sandbox
        // RPC (no agent pod is actually listening in this test) while still
        // exercising the registry release.
        let stored = store.update(stored).await.unwrap();

        reconciler.reconcile_one(stored).await;

        let refreshed = store.get("default", "c").await.unwrap().unwrap();
        assert_eq!(refreshed.sandbox.status.phase, SandboxPhase::Pending);
        assert_eq!(refreshed.sandbox.status.accepted_reset_revision, Some(2));
        assert!(refreshed.sandbox.status.assigned_pod.is_none());

        let handle = registry.get("g1").await.unwrap();
        let info = handle.lock().await;
        assert_eq!(info.allocated, 0);
        assert!(!info.used_ports.contains(&8080));
    }

    #[allow(dead_code)]
    fn _unused(_: HashSet<u16>) {}
}
