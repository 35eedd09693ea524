//! In-memory Registry of Agent state (`spec.md` §4.1). The source of truth
//! for allocation decisions — never the durable store, which can lag behind
//! by a reconcile interval. Rebuilt from scratch on Controller restart via
//! the first round of the control loop; nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fastsandbox_types::model::AgentInfo;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// How stale a heartbeat can be before the agent is considered lost
/// (`spec.md` §4.1, `AGENT_LOST_THRESHOLD`).
pub const AGENT_LOST_THRESHOLD: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NoCapacity,
    PortConflict,
    UnknownAgent(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NoCapacity => write!(f, "no agent has spare capacity"),
            RegistryError::PortConflict => write!(f, "no agent can satisfy the requested ports"),
            RegistryError::UnknownAgent(id) => write!(f, "unknown agent: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Candidate criteria for picking an agent within a pool (`spec.md` §4.1).
pub struct AllocationRequest<'a> {
    pub pool_name: &'a str,
    pub ports: &'a [u16],
    pub image: &'a str,
}

/// Holds every known agent behind an outer `RwLock` (membership) and an
/// inner per-agent `Mutex` (mutation), so one agent's slow allocation never
/// blocks a lookup against a different agent. The outer lock is only ever
/// held long enough to clone an `Arc` or touch the map shape — never across
/// an `.await` that does remote I/O.
pub struct Registry {
    agents: RwLock<HashMap<String, Arc<Mutex<AgentInfo>>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
        })
    }

    /// Register a newly-seen agent or refresh an already-known one's
    /// self-reported fields (`spec.md` §4.1 `RegisterOrUpdate`). `allocated`
    /// and `used_ports` are Controller-authoritative — the Agent never
    /// reports them — so an existing entry keeps its own values rather than
    /// being clobbered by whatever the incoming snapshot happened to carry.
    pub async fn upsert(&self, info: AgentInfo) {
        let mut agents = self.agents.write().await;
        match agents.get(&info.id) {
            Some(existing) => {
                let mut guard = existing.lock().await;
                let allocated = guard.allocated;
                let used_ports = std::mem::take(&mut guard.used_ports);
                *guard = info;
                guard.allocated = allocated;
                guard.used_ports = used_ports;
            }
            None => {
                agents.insert(info.id.clone(), Arc::new(Mutex::new(info)));
            }
        }
    }

    /// Rebuild `allocated`/`used_ports` for every known agent from the
    /// durable store, run once at startup before the control loop's first
    /// tick so a Controller restart doesn't forget in-flight reservations
    /// (`spec.md` §4.1 `Restore(store)`). Sandboxes with no assigned agent,
    /// or whose phase is already terminal, hold no agent-side resources and
    /// are skipped.
    pub async fn restore(
        &self,
        store: &dyn fastsandbox_types::store::DurableStore,
    ) -> Result<(), fastsandbox_types::store::StoreError> {
        let all = store.list_all().await?;
        let agents = self.agents.read().await;
        for stored in all {
            let sandbox = stored.sandbox;
            let Some(agent_id) = sandbox.status.assigned_pod.as_deref() else {
                continue;
            };
            if sandbox.status.phase.is_terminal() {
                continue;
            }
            if let Some(handle) = agents.get(agent_id) {
                let mut info = handle.lock().await;
                info.allocated += 1;
                for p in &sandbox.spec.exposed_ports {
                    info.used_ports.insert(*p);
                }
            }
        }
        Ok(())
    }

    pub async fn remove(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<Mutex<AgentInfo>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut out = Vec::with_capacity(agents.len());
        for handle in agents.values() {
            out.push(handle.lock().await.clone());
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Evict agents whose heartbeat has aged past `threshold` (`spec.md`
    /// §6's configurable stale-agent timeout, `AGENT_LOST_THRESHOLD` by
    /// default). Returns the evicted agent IDs so callers (the reconciler)
    /// can mark their sandboxes `Lost`.
    pub async fn evict_stale(&self, threshold: Duration) -> Vec<String> {
        let now = chrono::Utc::now();
        let mut stale = Vec::new();
        {
            let agents = self.agents.read().await;
            for (id, handle) in agents.iter() {
                let info = handle.lock().await;
                let age = now.signed_duration_since(info.last_heartbeat);
                if age.to_std().unwrap_or_default() > threshold {
                    stale.push(id.clone());
                }
            }
        }
        if !stale.is_empty() {
            let mut agents = self.agents.write().await;
            for id in &stale {
                warn!(agent_id = %id, "evicting stale agent from registry");
                agents.remove(id);
            }
        }
        stale
    }

    /// Pick the agent that best satisfies `req`, scoring candidates by
    /// spare capacity and image affinity (agents that already have the
    /// image cached win ties — `spec.md` §4.1).
    pub async fn select_agent(
        &self,
        req: &AllocationRequest<'_>,
    ) -> Result<String, RegistryError> {
        let agents = self.agents.read().await;
        let mut best: Option<(String, i64)> = None;

        for (id, handle) in agents.iter() {
            let info = handle.lock().await;
            if info.pool_name != req.pool_name {
                continue;
            }
            if !info.has_capacity() || !info.ports_free(req.ports) {
                continue;
            }
            let spare = (info.capacity - info.allocated) as i64;
            let affinity_bonus = if info.has_image(req.image) { 1_000 } else { 0 };
            let score = spare + affinity_bonus;

            match &best {
                Some((_, best_score)) if *best_score >= score => {}
                _ => best = Some((id.clone(), score)),
            }
        }

        match best {
            Some((id, _)) => Ok(id),
            None => {
                let any_capacity = agents
                    .values()
                    .any(|h| h.try_lock().map(|i| i.has_capacity()).unwrap_or(false));
                if any_capacity {
                    Err(RegistryError::PortConflict)
                } else {
                    Err(RegistryError::NoCapacity)
                }
            }
        }
    }

    /// Reserve one slot and the requested ports on `agent_id`, re-checking
    /// capacity under the per-agent lock (the read in `select_agent` is
    /// advisory only — another allocation may have raced it). Strictly
    /// idempotent release is handled by `release`, not here.
    pub async fn reserve(
        &self,
        agent_id: &str,
        ports: &[u16],
        image: &str,
    ) -> Result<(), RegistryError> {
        let handle = self
            .get(agent_id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        let mut info = handle.lock().await;
        if !info.has_capacity() {
            return Err(RegistryError::NoCapacity);
        }
        if !info.ports_free(ports) {
            return Err(RegistryError::PortConflict);
        }
        info.allocated += 1;
        for p in ports {
            info.used_ports.insert(*p);
        }
        info.images.insert(image.to_string());
        debug!(agent_id, allocated = info.allocated, "reserved slot");
        Ok(())
    }

    /// Release a previously reserved slot and its ports. Idempotent: a
    /// double release (the race noted in `spec.md`'s Open Questions) is a
    /// no-op rather than underflowing `allocated`, and releasing against an
    /// unknown agent is silently ignored — the agent is already gone from
    /// the registry by the time this runs in that case.
    pub async fn release(&self, agent_id: &str, ports: &[u16]) {
        let Some(handle) = self.get(agent_id).await else {
            return;
        };
        let mut info = handle.lock().await;
        info.allocated = info.allocated.saturating_sub(1);
        for p in ports {
            info.used_ports.remove(p);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastsandbox_types::DurableStore;
    use std::collections::{HashMap as Map, HashSet};

    fn agent(id: &str, pool: &str, capacity: u32) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            namespace: "default".to_string(),
            pod_ip: "10.0.0.1".to_string(),
            node_name: "node-1".to_string(),
            pool_name: pool.to_string(),
            capacity,
            allocated: 0,
            used_ports: HashSet::new(),
            images: HashSet::new(),
            sandbox_statuses: Map::new(),
            last_heartbeat: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn select_agent_picks_one_with_capacity() {
        let registry = Registry::new();
        registry.upsert(agent("a1", "pool", 1)).await;
        let req = AllocationRequest {
            pool_name: "pool",
            ports: &[8080],
            image: "alpine",
        };
        assert_eq!(registry.select_agent(&req).await.unwrap(), "a1");
    }

    #[tokio::test]
    async fn select_agent_skips_full_agent() {
        let registry = Registry::new();
        let mut full = agent("a1", "pool", 1);
        full.allocated = 1;
        registry.upsert(full).await;
        let req = AllocationRequest {
            pool_name: "pool",
            ports: &[8080],
            image: "alpine",
        };
        assert_eq!(
            registry.select_agent(&req).await.unwrap_err(),
            RegistryError::NoCapacity
        );
    }

    #[tokio::test]
    async fn select_agent_skips_port_conflict() {
        let registry = Registry::new();
        let mut busy = agent("a1", "pool", 5);
        busy.used_ports.insert(8080);
        registry.upsert(busy).await;
        let req = AllocationRequest {
            pool_name: "pool",
            ports: &[8080],
            image: "alpine",
        };
        assert_eq!(
            registry.select_agent(&req).await.unwrap_err(),
            RegistryError::PortConflict
        );
    }

    #[tokio::test]
    async fn select_agent_prefers_image_affinity_on_tie() {
        let registry = Registry::new();
        let mut no_image = agent("a1", "pool", 2);
        no_image.allocated = 1;
        let mut has_image = agent("a2", "pool", 2);
        has_image.allocated = 1;
        has_image.images.insert("alpine".to_string());
        registry.upsert(no_image).await;
        registry.upsert(has_image).await;

        let req = AllocationRequest {
            pool_name: "pool",
            ports: &[],
            image: "alpine",
        };
        assert_eq!(registry.select_agent(&req).await.unwrap(), "a2");
    }

    #[tokio::test]
    async fn reserve_then_release_is_idempotent() {
        let registry = Registry::new();
        registry.upsert(agent("a1", "pool", 1)).await;
        registry.reserve("a1", &[8080], "alpine").await.unwrap();

        let handle = registry.get("a1").await.unwrap();
        assert_eq!(handle.lock().await.allocated, 1);

        registry.release("a1", &[8080]).await;
        registry.release("a1", &[8080]).await; // double release: must not underflow
        assert_eq!(handle.lock().await.allocated, 0);
    }

    #[tokio::test]
    async fn release_on_unknown_agent_is_noop() {
        let registry = Registry::new();
        registry.release("ghost", &[8080]).await;
    }

    #[tokio::test]
    async fn upsert_preserves_allocated_and_used_ports_on_refresh() {
        let registry = Registry::new();
        registry.upsert(agent("a1", "pool", 4)).await;
        registry.reserve("a1", &[8080], "alpine").await.unwrap();

        let mut refreshed = agent("a1", "pool", 4);
        refreshed.pod_ip = "10.0.0.9".to_string();
        registry.upsert(refreshed).await;

        let handle = registry.get("a1").await.unwrap();
        let info = handle.lock().await;
        assert_eq!(info.allocated, 1);
        assert!(info.used_ports.contains(&8080));
        assert_eq!(info.pod_ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn restore_rebuilds_allocation_from_store() {
        use fastsandbox_types::model::{Sandbox, SandboxPhase, SandboxSpec};
        use fastsandbox_types::store::InMemoryStore;

        let store = InMemoryStore::new();
        let spec = SandboxSpec {
            image: "alpine".to_string(),
            command: vec![],
            args: vec![],
            env: Default::default(),
            working_dir: String::new(),
            exposed_ports: vec![8080],
            pool_ref: "pool".to_string(),
            expire_time_unix_nano: None,
            failure_policy: Default::default(),
            recovery_timeout_seconds: 0,
            reset_revision: None,
        };
        let mut stored = store
            .create(Sandbox::new("default", "a", spec))
            .await
            .unwrap();
        stored.sandbox.status.phase = SandboxPhase::Running;
        stored.sandbox.status.assigned_pod = Some("a1".to_string());
        store.update(stored).await.unwrap();

        let registry = Registry::new();
        registry.upsert(agent("a1", "pool", 4)).await;
        registry.restore(store.as_ref()).await.unwrap();

        let handle = registry.get("a1").await.unwrap();
        let info = handle.lock().await;
        assert_eq!(info.allocated, 1);
        assert!(info.used_ports.contains(&8080));
    }

    #[tokio::test]
    async fn evict_stale_removes_old_heartbeats() {
        let registry = Registry::new();
        let mut stale = agent("a1", "pool", 1);
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(120);
        registry.upsert(stale).await;
        registry.upsert(agent("a2", "pool", 1)).await;

        let evicted = registry.evict_stale(AGENT_LOST_THRESHOLD).await;
        assert_eq!(evicted, vec!["a1".to_string()]);
        assert_eq!(registry.len().await, 1);
    }
}
