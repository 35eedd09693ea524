//! Tracks every sandbox this Agent owns and drives it through the Agent's
//! side of the create/delete protocol (`spec.md` §4.4). Create is
//! idempotent and delete is tombstone-free: a placeholder is inserted
//! under the map lock before the slow Runtime call runs, so a second
//! create for the same `sandbox_id` sees the placeholder and waits instead
//! of racing a duplicate container into existence; on delete completion the
//! entry is removed outright rather than left as a tombstone.

use std::collections::HashMap;
use std::sync::Arc;

use fastsandbox_types::labels::OwnershipLabels;
use fastsandbox_types::model::{AgentReportedPhase, Endpoint};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::runtime::{Runtime, RuntimeCreateSpec, RuntimeError};

#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub namespace: String,
    pub name: String,
    pub sandbox_id: String,
    pub claim_uid: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub exposed_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
enum EntryState {
    /// Inserted before the Runtime call returns; a concurrent create for the
    /// same ID waits on this rather than starting a second container.
    Creating { claim_uid: String },
    Ready {
        claim_uid: String,
        container_id: String,
        endpoints: Vec<Endpoint>,
    },
    Terminating { claim_uid: String },
    Failed { claim_uid: String, message: String },
}

struct Entry {
    state: Mutex<EntryState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxManagerError {
    AlreadyCreating,
    ClaimMismatch,
    Runtime(String),
    NotFound,
}

impl std::fmt::Display for SandboxManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxManagerError::AlreadyCreating => write!(f, "sandbox is already being created"),
            SandboxManagerError::ClaimMismatch => {
                write!(f, "sandbox exists under a different claim")
            }
            SandboxManagerError::Runtime(msg) => write!(f, "runtime error: {msg}"),
            SandboxManagerError::NotFound => write!(f, "sandbox not found"),
        }
    }
}

impl std::error::Error for SandboxManagerError {}

impl From<RuntimeError> for SandboxManagerError {
    fn from(e: RuntimeError) -> Self {
        SandboxManagerError::Runtime(e.to_string())
    }
}

pub struct SandboxManager {
    agent_id: String,
    agent_uid: String,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    runtime: Arc<dyn Runtime>,
}

pub struct SandboxStatusEntry {
    pub sandbox_id: String,
    pub claim_uid: String,
    pub phase: AgentReportedPhase,
    pub message: String,
}

impl SandboxManager {
    pub fn new(
        agent_id: impl Into<String>,
        agent_uid: impl Into<String>,
        runtime: Arc<dyn Runtime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            agent_uid: agent_uid.into(),
            entries: RwLock::new(HashMap::new()),
            runtime,
        })
    }

    pub async fn active_count(&self) -> u32 {
        self.entries.read().await.len() as u32
    }

    /// Create a sandbox, or return the existing result if `sandbox_id` was
    /// already created under the same `claim_uid` (idempotent retry).
    pub async fn create(&self, spec: CreateSpec) -> Result<Vec<Endpoint>, SandboxManagerError> {
        let entry = {
            let mut entries = self.entries.write().await;
            match entries.get(&spec.sandbox_id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let entry = Arc::new(Entry {
                        state: Mutex::new(EntryState::Creating {
                            claim_uid: spec.claim_uid.clone(),
                        }),
                    });
                    entries.insert(spec.sandbox_id.clone(), Arc::clone(&entry));
                    return self.run_create(spec, entry).await;
                }
            }
        };

        let state = entry.state.lock().await;
        match &*state {
            EntryState::Creating { claim_uid } if *claim_uid == spec.claim_uid => {
                Err(SandboxManagerError::AlreadyCreating)
            }
            EntryState::Ready {
                claim_uid,
                endpoints,
                ..
            } if *claim_uid == spec.claim_uid => Ok(endpoints.clone()),
            EntryState::Failed { claim_uid, message } if *claim_uid == spec.claim_uid => {
                Err(SandboxManagerError::Runtime(message.clone()))
            }
            _ => Err(SandboxManagerError::ClaimMismatch),
        }
    }

    async fn run_create(
        &self,
        spec: CreateSpec,
        entry: Arc<Entry>,
    ) -> Result<Vec<Endpoint>, SandboxManagerError> {
        let labels = OwnershipLabels {
            agent_name: self.agent_id.clone(),
            agent_uid: self.agent_uid.clone(),
            namespace: spec.namespace.clone(),
            sandbox_id: spec.sandbox_id.clone(),
            claim_uid: spec.claim_uid.clone(),
            sandbox_name: spec.name.clone(),
        };
        let container_name = format!("fastsandbox-{}", spec.sandbox_id);

        let result = self
            .runtime
            .create(RuntimeCreateSpec {
                container_name: &container_name,
                image: &spec.image,
                command: &spec.command,
                args: &spec.args,
                env: &spec.env,
                exposed_ports: &spec.exposed_ports,
                labels: &labels,
            })
            .await;

        match result {
            Ok(handle) => {
                let endpoints: Vec<Endpoint> = handle
                    .host_ports
                    .into_iter()
                    .map(|(_, host_port)| Endpoint::new("0.0.0.0", host_port))
                    .collect();
                let mut state = entry.state.lock().await;
                *state = EntryState::Ready {
                    claim_uid: spec.claim_uid.clone(),
                    container_id: handle.container_id,
                    endpoints: endpoints.clone(),
                };
                info!(sandbox_id = %spec.sandbox_id, "sandbox created");
                Ok(endpoints)
            }
            Err(e) => {
                let mut state = entry.state.lock().await;
                *state = EntryState::Failed {
                    claim_uid: spec.claim_uid.clone(),
                    message: e.to_string(),
                };
                warn!(sandbox_id = %spec.sandbox_id, error = %e, "sandbox create failed");
                Err(e.into())
            }
        }
    }

    /// Mark `sandbox_id` `Terminating` and return the container to tear
    /// down, if any. `None` means the entry was already gone (delete is
    /// idempotent); `Some(None)` means it existed but had no running
    /// container to destroy.
    async fn mark_terminating(&self, sandbox_id: &str) -> Option<Option<String>> {
        let entry = {
            let entries = self.entries.read().await;
            Arc::clone(entries.get(sandbox_id)?)
        };

        let mut state = entry.state.lock().await;
        let container_id = match &*state {
            EntryState::Ready {
                claim_uid,
                container_id,
                ..
            } => {
                let container_id = container_id.clone();
                *state = EntryState::Terminating {
                    claim_uid: claim_uid.clone(),
                };
                Some(container_id)
            }
            EntryState::Creating { .. } | EntryState::Terminating { .. } => None,
            EntryState::Failed { .. } => None,
        };
        Some(container_id)
    }

    /// Delete a sandbox. Marks the entry `Terminating` synchronously, then
    /// spawns the Runtime teardown (a container-engine round trip that can
    /// take seconds) in the background so the caller isn't blocked on it;
    /// the entry is removed outright once that teardown finishes rather
    /// than left as a tombstone. `destroy_all` drains synchronously instead
    /// since shutdown has to wait for every sandbox to actually be gone.
    pub async fn delete(self: &Arc<Self>, sandbox_id: &str) -> Result<(), SandboxManagerError> {
        let container_id = match self.mark_terminating(sandbox_id).await {
            None => return Ok(()),
            Some(container_id) => container_id,
        };

        let Some(container_id) = container_id else {
            self.entries.write().await.remove(sandbox_id);
            return Ok(());
        };

        let manager = Arc::clone(self);
        let sandbox_id = sandbox_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.runtime.destroy(&container_id).await {
                warn!(sandbox_id = %sandbox_id, error = %e, "runtime destroy failed during delete");
            }
            manager.entries.write().await.remove(&sandbox_id);
            info!(sandbox_id = %sandbox_id, "sandbox deleted");
        });

        Ok(())
    }

    /// Synchronous teardown used by `destroy_all`.
    async fn delete_sync(&self, sandbox_id: &str) -> Result<(), SandboxManagerError> {
        let container_id = match self.mark_terminating(sandbox_id).await {
            None => return Ok(()),
            Some(container_id) => container_id,
        };

        if let Some(container_id) = container_id {
            self.runtime.destroy(&container_id).await?;
        }

        self.entries.write().await.remove(sandbox_id);
        info!(sandbox_id, "sandbox deleted");
        Ok(())
    }

    /// Stream the logs of a tracked sandbox's container.
    pub async fn logs(
        &self,
        sandbox_id: &str,
        follow: bool,
    ) -> Result<
        tokio_stream::wrappers::ReceiverStream<Result<Vec<u8>, RuntimeError>>,
        SandboxManagerError,
    > {
        let container_id = {
            let entries = self.entries.read().await;
            let entry = entries.get(sandbox_id).ok_or(SandboxManagerError::NotFound)?;
            let state = entry.state.lock().await;
            match &*state {
                EntryState::Ready { container_id, .. } => container_id.clone(),
                _ => return Err(SandboxManagerError::NotFound),
            }
        };
        Ok(self.runtime.get_logs(&container_id, follow).await?)
    }

    /// Images cached on this Agent's node, for the `/status` snapshot.
    pub async fn images(&self) -> Vec<String> {
        self.runtime.list_images().await.unwrap_or_default()
    }

    pub async fn status(&self) -> Vec<SandboxStatusEntry> {
        let entries = self.entries.read().await;
        let mut out = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            let state = entry.state.lock().await;
            let (claim_uid, phase, message) = match &*state {
                EntryState::Creating { claim_uid } => {
                    (claim_uid.clone(), AgentReportedPhase::Creating, String::new())
                }
                EntryState::Ready { claim_uid, .. } => {
                    (claim_uid.clone(), AgentReportedPhase::Running, String::new())
                }
                EntryState::Terminating { claim_uid } => (
                    claim_uid.clone(),
                    AgentReportedPhase::Terminating,
                    String::new(),
                ),
                EntryState::Failed { claim_uid, message } => {
                    (claim_uid.clone(), AgentReportedPhase::Failed, message.clone())
                }
            };
            out.push(SandboxStatusEntry {
                sandbox_id: id.clone(),
                claim_uid,
                phase,
                message,
            });
        }
        out
    }

    /// Drain: tear down every tracked sandbox. Used on graceful shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.delete_sync(&id).await {
                warn!(sandbox_id = %id, error = %e, "failed to destroy sandbox during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn spec(sandbox_id: &str, claim_uid: &str) -> CreateSpec {
        CreateSpec {
            namespace: "default".to_string(),
            name: "box".to_string(),
            sandbox_id: sandbox_id.to_string(),
            claim_uid: claim_uid.to_string(),
            image: "alpine".to_string(),
            command: vec![],
            args: vec![],
            env: HashMap::new(),
            exposed_ports: vec![8080],
        }
    }

    #[tokio::test]
    async fn create_then_status_reports_running() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        manager.create(spec("sb_1", "claim-1")).await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].phase, AgentReportedPhase::Running);
    }

    #[tokio::test]
    async fn duplicate_create_same_claim_is_idempotent() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        let first = manager.create(spec("sb_1", "claim-1")).await.unwrap();
        let second = manager.create(spec("sb_1", "claim-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn create_with_different_claim_same_id_conflicts() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        manager.create(spec("sb_1", "claim-1")).await.unwrap();
        let err = manager.create(spec("sb_1", "claim-2")).await.unwrap_err();
        assert_eq!(err, SandboxManagerError::ClaimMismatch);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        manager.create(spec("sb_1", "claim-1")).await.unwrap();
        manager.delete("sb_1").await.unwrap();

        // Teardown runs in a spawned background task; wait for it to land
        // instead of racing it.
        for _ in 0..100 {
            if manager.active_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn delete_unknown_sandbox_is_idempotent() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        manager.delete("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn destroy_all_clears_every_entry() {
        let manager = SandboxManager::new("agent-1", "uid-1", Arc::new(MockRuntime::new()));
        manager.create(spec("sb_1", "claim-1")).await.unwrap();
        manager.create(spec("sb_2", "claim-2")).await.unwrap();
        manager.destroy_all().await;
        assert_eq!(manager.active_count().await, 0);
    }
}
