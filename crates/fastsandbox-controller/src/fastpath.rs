//! The Fast-Path gRPC surface (`spec.md` §4.6): the low-latency create path
//! that talks to an Agent directly and persists the allocation decision as
//! an annotation, rather than waiting on a full reconcile round-trip.
//! Strong-mode requests instead go straight to the `DurableStore` and let
//! the `Reconciler` drive them — this service only special-cases Fast mode.

use std::sync::Arc;

use fastsandbox_types::model::{
    AllocationAnnotation, Sandbox, SandboxPhase, SandboxSpec, ANNOTATION_ALLOCATION,
    ANNOTATION_CREATE_TIMESTAMP, CREATED_BY_FASTPATH_FAST, LABEL_CREATED_BY,
};
use fastsandbox_types::store::{DurableStore, StoredSandbox};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use fastsandbox_types::error::CoreError;

use crate::agent_client::{AgentClient, CreateRequest as AgentCreateRequest};
use crate::registry::{AllocationRequest, Registry, RegistryError};
use crate::sandbox_id::derive_id;

pub mod proto {
    tonic::include_proto!("fastsandbox.fastpath.v1");
}

/// How many times the background persist retries before giving up and
/// leaving the Agent-side sandbox for the Janitor to reclaim (`spec.md`
/// §4.6 Fast mode step 6).
const FAST_PERSIST_RETRY_BUDGET: u32 = 5;
const FAST_PERSIST_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

pub struct FastPathService {
    store: Arc<dyn DurableStore>,
    registry: Arc<Registry>,
    agent_port: u16,
}

impl FastPathService {
    pub fn new(store: Arc<dyn DurableStore>, registry: Arc<Registry>, agent_port: u16) -> Self {
        Self {
            store,
            registry,
            agent_port,
        }
    }
}

#[tonic::async_trait]
impl proto::fast_path_server::FastPath for FastPathService {
    async fn create_sandbox(
        &self,
        request: Request<proto::CreateSandboxRequest>,
    ) -> Result<Response<proto::CreateSandboxResponse>, Status> {
        let req = request.into_inner();
        let spec = SandboxSpec {
            image: req.image,
            command: req.command,
            args: req.args,
            env: req.envs,
            working_dir: req.working_dir,
            exposed_ports: req.exposed_ports.iter().map(|p| *p as u16).collect(),
            pool_ref: req.pool_ref,
            expire_time_unix_nano: (req.expire_time_unix_nano != 0)
                .then_some(req.expire_time_unix_nano),
            failure_policy: Default::default(),
            recovery_timeout_seconds: 0,
            reset_revision: None,
        };

        if req.consistency_mode == proto::ConsistencyMode::Fast as i32 {
            self.create_fast(req.namespace, req.name, spec).await
        } else {
            self.create_strong(req.namespace, req.name, spec).await
        }
    }

    async fn delete_sandbox(
        &self,
        request: Request<proto::DeleteSandboxRequest>,
    ) -> Result<Response<proto::DeleteSandboxResponse>, Status> {
        let req = request.into_inner();
        let stored = self
            .store
            .get(&req.namespace, &req.name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| Status::not_found("sandbox not found"))?;

        let mut sandbox = stored.sandbox;
        sandbox.deletion_timestamp = Some(chrono::Utc::now());
        self.store
            .update(StoredSandbox {
                sandbox,
                resource_version: stored.resource_version,
            })
            .await
            .map_err(store_err)?;

        Ok(Response::new(proto::DeleteSandboxResponse {
            success: true,
            message: "deletion requested".to_string(),
        }))
    }

    async fn update_sandbox(
        &self,
        request: Request<proto::UpdateSandboxRequest>,
    ) -> Result<Response<proto::UpdateSandboxResponse>, Status> {
        let req = request.into_inner();
        let stored = self
            .store
            .get(&req.namespace, &req.name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| Status::not_found("sandbox not found"))?;

        let mut sandbox = stored.sandbox;
        if let Some(expire) = req.expire_time_unix_nano {
            sandbox.spec.expire_time_unix_nano = Some(expire);
        }
        if let Some(reset_revision) = req.reset_revision {
            sandbox.spec.reset_revision = Some(reset_revision);
        }
        self.store
            .update(StoredSandbox {
                sandbox,
                resource_version: stored.resource_version,
            })
            .await
            .map_err(store_err)?;

        Ok(Response::new(proto::UpdateSandboxResponse { success: true }))
    }

    async fn list_sandboxes(
        &self,
        request: Request<proto::ListSandboxesRequest>,
    ) -> Result<Response<proto::ListSandboxesResponse>, Status> {
        let req = request.into_inner();
        let all = self.store.list(&req.namespace).await.map_err(store_err)?;
        let sandboxes = all.into_iter().map(|s| to_view(&s.sandbox)).collect();
        Ok(Response::new(proto::ListSandboxesResponse { sandboxes }))
    }

    async fn get_sandbox(
        &self,
        request: Request<proto::GetSandboxRequest>,
    ) -> Result<Response<proto::GetSandboxResponse>, Status> {
        let req = request.into_inner();
        let stored = self
            .store
            .get(&req.namespace, &req.name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| Status::not_found("sandbox not found"))?;
        Ok(Response::new(proto::GetSandboxResponse {
            sandbox: Some(to_view(&stored.sandbox)),
        }))
    }
}

impl FastPathService {
    /// `spec.md` §4.6 Strong mode: the durable write happens before the
    /// Agent is ever called, so a client that gets a success response is
    /// guaranteed the record already exists — no Janitor reclaim window,
    /// at the cost of one extra store round trip versus Fast mode.
    async fn create_strong(
        &self,
        namespace: String,
        name: String,
        spec: SandboxSpec,
    ) -> Result<Response<proto::CreateSandboxResponse>, Status> {
        let req = AllocationRequest {
            pool_name: &spec.pool_ref,
            ports: &spec.exposed_ports,
            image: &spec.image,
        };
        let agent_id = self.registry.select_agent(&req).await.map_err(registry_err)?;
        self.registry
            .reserve(&agent_id, &spec.exposed_ports, &spec.image)
            .await
            .map_err(registry_err)?;

        let agent_info = match self.registry.get(&agent_id).await {
            Some(h) => h.lock().await.clone(),
            None => {
                self.registry.release(&agent_id, &spec.exposed_ports).await;
                return Err(core_err_to_status(CoreError::AgentUnreachable {
                    agent_id,
                    reason: "agent vanished mid-allocation".to_string(),
                }));
            }
        };

        let create_timestamp = chrono::Utc::now();
        let allocation = AllocationAnnotation {
            assigned_pod: agent_info.id.clone(),
            assigned_node: agent_info.node_name.clone(),
            allocated_at: create_timestamp,
        };
        let spec_ports = spec.exposed_ports.clone();

        let mut sandbox = Sandbox::new(namespace, name, spec);
        if let Ok(encoded) = serde_json::to_string(&allocation) {
            sandbox
                .annotations
                .insert(ANNOTATION_ALLOCATION.to_string(), encoded);
        }

        let stored = match self.store.create(sandbox).await {
            Ok(s) => s,
            Err(e) => {
                self.registry.release(&agent_id, &spec_ports).await;
                return Err(store_err(e));
            }
        };

        let sandbox_id = stored.sandbox.uid.clone().unwrap_or_default();
        let claim_uid = sandbox_id.clone();
        let create_req = AgentCreateRequest {
            namespace: &stored.sandbox.namespace,
            name: &stored.sandbox.name,
            sandbox_id: &sandbox_id,
            claim_uid: &claim_uid,
            image: &stored.sandbox.spec.image,
            command: &stored.sandbox.spec.command,
            args: &stored.sandbox.spec.args,
            env: &stored.sandbox.spec.env,
            exposed_ports: &stored.sandbox.spec.exposed_ports,
        };
        let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
        let created = match client.create_sandbox(&create_req).await {
            Ok(resp) => resp,
            Err(e) => {
                let core = agent_client_err(&agent_info.id, e);
                warn!(sandbox = %stored.sandbox.key(), error = %core, "strong-mode agent create failed, rolling back");
                let _ = self.store.delete(&stored.sandbox.namespace, &stored.sandbox.name).await;
                self.registry.release(&agent_id, &stored.sandbox.spec.exposed_ports).await;
                return Err(core_err_to_status(core));
            }
        };

        let mut sandbox = stored.sandbox;
        sandbox.add_finalizer();
        sandbox.status.phase = SandboxPhase::Bound;
        sandbox.status.assigned_pod = Some(agent_info.id.clone());
        sandbox.status.node_name = Some(agent_info.node_name.clone());
        sandbox.status.sandbox_id = Some(sandbox_id.clone());
        sandbox.status.endpoints = created.endpoints.clone();
        let key = sandbox.key();
        if let Err(e) = self
            .store
            .update(StoredSandbox {
                sandbox,
                resource_version: stored.resource_version,
            })
            .await
        {
            warn!(sandbox = %key, error = %e, "strong-mode status update failed, reconciler will pick up the allocation annotation");
        }

        info!(sandbox = %key, agent_id = %agent_info.id, "strong-mode sandbox persisted and bound");
        Ok(Response::new(proto::CreateSandboxResponse {
            sandbox_id,
            agent_pod: agent_info.id,
            endpoints: created
                .endpoints
                .into_iter()
                .map(|e| proto::Endpoint {
                    port: e.port as u32,
                    address: e.address,
                })
                .collect(),
        }))
    }

    /// Allocate and create against an Agent directly, then persist the
    /// decision as an annotation so the durable record eventually catches
    /// up (`spec.md` §4.6.1). If the durable persist fails, the sandbox
    /// still exists on the Agent — the Janitor will reconcile that orphan
    /// once the annotation never shows up in the store within its
    /// protection window.
    async fn create_fast(
        &self,
        namespace: String,
        name: String,
        spec: SandboxSpec,
    ) -> Result<Response<proto::CreateSandboxResponse>, Status> {
        let create_timestamp = chrono::Utc::now();
        let sandbox_id = derive_id(&namespace, &name, create_timestamp.timestamp_nanos_opt().unwrap_or(0));

        let req = AllocationRequest {
            pool_name: &spec.pool_ref,
            ports: &spec.exposed_ports,
            image: &spec.image,
        };
        let agent_id = self.registry.select_agent(&req).await.map_err(registry_err)?;
        self.registry
            .reserve(&agent_id, &spec.exposed_ports, &spec.image)
            .await
            .map_err(registry_err)?;

        let agent_info = match self.registry.get(&agent_id).await {
            Some(h) => h.lock().await.clone(),
            None => {
                self.registry.release(&agent_id, &spec.exposed_ports).await;
                return Err(Status::unavailable("agent vanished mid-allocation"));
            }
        };

        let client = AgentClient::new(&agent_info.pod_ip, self.agent_port);
        let claim_uid = sandbox_id.clone();
        let create_req = AgentCreateRequest {
            namespace: &namespace,
            name: &name,
            sandbox_id: &sandbox_id,
            claim_uid: &claim_uid,
            image: &spec.image,
            command: &spec.command,
            args: &spec.args,
            env: &spec.env,
            exposed_ports: &spec.exposed_ports,
        };

        let created = match client.create_sandbox(&create_req).await {
            Ok(resp) => resp,
            Err(e) => {
                self.registry.release(&agent_id, &spec.exposed_ports).await;
                let core = agent_client_err(&agent_id, e);
                warn!(sandbox_id = %sandbox_id, error = %core, "fast-mode agent create failed");
                return Err(core_err_to_status(core));
            }
        };

        let mut sandbox = Sandbox::new(namespace, name, spec);
        sandbox.uid = Some(claim_uid);
        sandbox.labels.insert(
            LABEL_CREATED_BY.to_string(),
            CREATED_BY_FASTPATH_FAST.to_string(),
        );
        let create_ts_nanos = create_timestamp.timestamp_nanos_opt().unwrap_or(0);
        sandbox.annotations.insert(
            ANNOTATION_CREATE_TIMESTAMP.to_string(),
            create_ts_nanos.to_string(),
        );
        let allocation = AllocationAnnotation {
            assigned_pod: agent_info.id.clone(),
            assigned_node: agent_info.node_name.clone(),
            allocated_at: create_timestamp,
        };
        if let Ok(encoded) = serde_json::to_string(&allocation) {
            sandbox
                .annotations
                .insert(ANNOTATION_ALLOCATION.to_string(), encoded);
        }
        sandbox.add_finalizer();
        sandbox.status.phase = SandboxPhase::Running;
        sandbox.status.assigned_pod = Some(agent_info.id.clone());
        sandbox.status.node_name = Some(agent_info.node_name.clone());
        sandbox.status.sandbox_id = Some(sandbox_id.clone());
        sandbox.status.endpoints = created.endpoints.clone();

        let response = Response::new(proto::CreateSandboxResponse {
            sandbox_id: sandbox_id.clone(),
            agent_pod: agent_info.id.clone(),
            endpoints: created
                .endpoints
                .into_iter()
                .map(|e| proto::Endpoint {
                    port: e.port as u32,
                    address: e.address,
                })
                .collect(),
        });

        // Return to the caller immediately; the durable record catches up
        // in the background with a bounded retry budget (`spec.md` §4.6
        // Fast mode step 6). A crash or exhausted retry budget here leaves
        // an orphan container the Janitor reclaims past its protection
        // window.
        let store = Arc::clone(&self.store);
        tokio::spawn(persist_fast_sandbox(store, sandbox, sandbox_id));

        Ok(response)
    }
}

async fn persist_fast_sandbox(store: Arc<dyn DurableStore>, sandbox: Sandbox, sandbox_id: String) {
    let mut attempt = 0;
    loop {
        match store.create(sandbox.clone()).await {
            Ok(_) => {
                info!(sandbox_id = %sandbox_id, attempt, "fast-mode sandbox persisted");
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= FAST_PERSIST_RETRY_BUDGET {
                    warn!(sandbox_id = %sandbox_id, attempt, error = %e, "fast-mode durable persist exhausted retry budget, agent-side sandbox is now orphaned pending janitor reclaim");
                    return;
                }
                warn!(sandbox_id = %sandbox_id, attempt, error = %e, "fast-mode durable persist failed, retrying");
                tokio::time::sleep(FAST_PERSIST_RETRY_DELAY).await;
            }
        }
    }
}

fn to_view(sandbox: &Sandbox) -> proto::SandboxView {
    proto::SandboxView {
        namespace: sandbox.namespace.clone(),
        name: sandbox.name.clone(),
        phase: sandbox.status.phase.to_string(),
        assigned_pod: sandbox.status.assigned_pod.clone().unwrap_or_default(),
        sandbox_id: sandbox.status.sandbox_id.clone().unwrap_or_default(),
        endpoints: sandbox
            .status
            .endpoints
            .iter()
            .map(|e| proto::Endpoint {
                port: e.port as u32,
                address: e.address.clone(),
            })
            .collect(),
    }
}

fn store_err(e: fastsandbox_types::store::StoreError) -> Status {
    use fastsandbox_types::store::StoreError;
    let core = match e {
        StoreError::NotFound { namespace, name } => {
            CoreError::NotFound(format!("{namespace}/{name}"))
        }
        StoreError::AlreadyExists { namespace, name } => {
            CoreError::StoreConflict { key: format!("{namespace}/{name}") }
        }
        StoreError::Conflict { namespace, name, .. } => {
            CoreError::StoreConflict { key: format!("{namespace}/{name}") }
        }
        StoreError::Unavailable(reason) => CoreError::StoreUnavailable { reason },
    };
    core_err_to_status(core)
}

fn registry_err(e: RegistryError) -> Status {
    let core = match e {
        RegistryError::NoCapacity => CoreError::NoAvailableAgent {
            pool_ref: String::new(),
            reason: "no agent has spare capacity".to_string(),
        },
        RegistryError::PortConflict => CoreError::NoAvailableAgent {
            pool_ref: String::new(),
            reason: "no agent can satisfy the requested ports".to_string(),
        },
        RegistryError::UnknownAgent(id) => CoreError::AgentUnreachable {
            agent_id: id,
            reason: "agent not found in registry".to_string(),
        },
    };
    core_err_to_status(core)
}

fn agent_client_err(agent_id: &str, e: crate::agent_client::AgentClientError) -> CoreError {
    CoreError::AgentUnreachable {
        agent_id: agent_id.to_string(),
        reason: e.to_string(),
    }
}

fn core_err_to_status(e: CoreError) -> Status {
    match e {
        CoreError::NoAvailableAgent { .. } => Status::resource_exhausted(e.to_string()),
        CoreError::AgentUnreachable { .. } => Status::unavailable(e.to_string()),
        CoreError::StoreConflict { .. } => Status::aborted(e.to_string()),
        CoreError::StoreUnavailable { .. } => Status::unavailable(e.to_string()),
        CoreError::RuntimeCreateFailed { .. } | CoreError::RuntimeDeleteFailed { .. } => {
            Status::internal(e.to_string())
        }
        CoreError::NotFound(_) => Status::not_found(e.to_string()),
        CoreError::InvalidRequest(_) => Status::invalid_argument(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastsandbox_types::model::AgentInfo;
    use fastsandbox_types::store::InMemoryStore;
    use std::collections::{HashMap, HashSet};

    fn agent(id: &str, pool: &str) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            namespace: "default".to_string(),
            pod_ip: "127.0.0.1".to_string(),
            node_name: "node-1".to_string(),
            pool_name: pool.to_string(),
            capacity: 4,
            allocated: 0,
            used_ports: HashSet::new(),
            images: HashSet::new(),
            sandbox_statuses: HashMap::new(),
            last_heartbeat: chrono::Utc::now(),
        }
    }

    fn spec() -> SandboxSpec {
        SandboxSpec {
            image: "alpine".to_string(),
            command: vec![],
            args: vec![],
            env: Default::default(),
            working_dir: String::new(),
            exposed_ports: vec![],
            pool_ref: "p1".to_string(),
            expire_time_unix_nano: None,
            failure_policy: Default::default(),
            recovery_timeout_seconds: 0,
            reset_revision: None,
        }
    }

    #[tokio::test]
    async fn create_strong_without_capacity_fails() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let service = FastPathService::new(store, registry, 5758);

        let err = service
            .create_strong("default".to_string(), "a".to_string(), spec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn create_strong_unreachable_agent_rolls_back_store_and_registry() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry.upsert(agent("a1", "p1")).await;
        // Nothing listens on 127.0.0.1:1, so the agent /create call fails
        // and create_strong must undo both the store write and the reservation.
        let service = FastPathService::new(store.clone(), registry.clone(), 1);

        let err = service
            .create_strong("default".to_string(), "a".to_string(), spec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        assert!(store.get("default", "a").await.unwrap().is_none());
        let handle = registry.get("a1").await.unwrap();
        assert_eq!(handle.lock().await.allocated, 0);
    }

    #[tokio::test]
    async fn create_fast_without_capacity_fails() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        let service = FastPathService::new(store, registry, 5758);

        let err = service
            .create_fast("default".to_string(), "a".to_string(), spec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn create_fast_unreachable_agent_releases_reservation() {
        let store = InMemoryStore::new();
        let registry = Registry::new();
        registry.upsert(agent("a1", "p1")).await;
        let service = FastPathService::new(store, registry.clone(), 1);

        let err = service
            .create_fast("default".to_string(), "a".to_string(), spec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let handle = registry.get("a1").await.unwrap();
        assert_eq!(handle.lock().await.allocated, 0);
    }
}
