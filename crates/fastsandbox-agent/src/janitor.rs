//! Orphan reclamation (`spec.md` §4.8): physical containers are orphaned
//! when either their `agent-uid` label doesn't match this process's own
//! (leftover from a prior incarnation of this pod) or no durable Sandbox
//! record claims their `id` label any more. A container is only destroyed
//! after surviving `PROTECTION_WINDOW` worth of sweeps, so a Fast-mode
//! create whose durable persist hasn't landed yet never gets torn down out
//! from under itself. Runs two tasks: a periodic scan and a watch that
//! sweeps immediately on sandbox deletion instead of waiting for the next
//! tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fastsandbox_types::labels;
use fastsandbox_types::store::{DurableStore, StoreEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::runtime::Runtime;

const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
const PROTECTION_WINDOW: Duration = Duration::from_secs(10);

pub struct Janitor {
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn DurableStore>,
    own_agent_uid: String,
    suspects: Mutex<HashMap<String, Instant>>,
}

impl Janitor {
    pub fn new(runtime: Arc<dyn Runtime>, store: Arc<dyn DurableStore>, own_agent_uid: impl Into<String>) -> Self {
        Self {
            runtime,
            store,
            own_agent_uid: own_agent_uid.into(),
            suspects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let scan = tokio::spawn(Arc::clone(&self).run_periodic_scan());
        let watch = tokio::spawn(self.run_deletion_watch());
        let _ = tokio::join!(scan, watch);
    }

    async fn run_periodic_scan(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// Reacts to sandbox deletions by sweeping right away rather than
    /// waiting out the rest of `SWEEP_INTERVAL` — a deleted Sandbox usually
    /// means its container can be reclaimed immediately.
    async fn run_deletion_watch(self: Arc<Self>) {
        let mut rx = self.store.watch().await;
        loop {
            match rx.recv().await {
                Ok(StoreEvent::Deleted { namespace, name }) => {
                    info!(namespace, name, "sandbox deletion observed, sweeping for orphans");
                    self.sweep().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "janitor deletion watch lagged, falling back to periodic scan");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn sweep(&self) {
        let managed = match self.runtime.list_managed().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "janitor failed to list managed containers");
                return;
            }
        };

        let known_sandbox_ids: std::collections::HashSet<String> = match self.store.list_all().await {
            Ok(sandboxes) => sandboxes
                .into_iter()
                .filter_map(|s| s.sandbox.status.sandbox_id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "janitor failed to read durable store, skipping sweep");
                return;
            }
        };

        let mut suspects = self.suspects.lock().await;
        let now = Instant::now();
        let mut still_orphaned = HashMap::new();

        for container in &managed {
            let stale_agent = container
                .labels
                .get(labels::AGENT_UID)
                .map_or(true, |uid| *uid != self.own_agent_uid);
            let unclaimed = container
                .labels
                .get(labels::SANDBOX_ID)
                .map_or(true, |id| !known_sandbox_ids.contains(id));

            if !stale_agent && !unclaimed {
                continue;
            }

            let first_seen = suspects
                .get(&container.container_id)
                .copied()
                .unwrap_or(now);
            still_orphaned.insert(container.container_id.clone(), first_seen);

            if now.duration_since(first_seen) >= PROTECTION_WINDOW {
                info!(container_id = %container.container_id, "reclaiming orphaned container");
                if let Err(e) = self.runtime.destroy(&container.container_id).await {
                    warn!(container_id = %container.container_id, error = %e, "failed to reclaim orphan");
                }
            }
        }

        *suspects = still_orphaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, ManagedContainer, RuntimeCreateSpec, RuntimeError, RuntimeHandle};
    use async_trait::async_trait;
    use fastsandbox_types::model::{Sandbox, SandboxSpec};
    use fastsandbox_types::store::InMemoryStore;
    use std::collections::HashMap as Map;
    use tokio_stream::wrappers::ReceiverStream;

    struct FixedRuntime {
        containers: Vec<ManagedContainer>,
    }

    #[async_trait]
    impl Runtime for FixedRuntime {
        async fn create(&self, _spec: RuntimeCreateSpec<'_>) -> Result<RuntimeHandle, RuntimeError> {
            unimplemented!()
        }
        async fn destroy(&self, _container_id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn is_running(&self, _container_id: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        async fn get_status(&self, _container_id: &str) -> Result<ContainerStatus, RuntimeError> {
            Ok(ContainerStatus::Running)
        }
        async fn get_logs(
            &self,
            _container_id: &str,
            _follow: bool,
        ) -> Result<ReceiverStream<Result<Vec<u8>, RuntimeError>>, RuntimeError> {
            unimplemented!()
        }
        async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(vec![])
        }
        async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
            Ok(self.containers.clone())
        }
    }

    fn labeled(id: &str, agent_uid: &str, sandbox_id: &str) -> ManagedContainer {
        let mut labels = Map::new();
        labels.insert(labels::AGENT_UID.to_string(), agent_uid.to_string());
        labels.insert(labels::SANDBOX_ID.to_string(), sandbox_id.to_string());
        ManagedContainer {
            container_id: id.to_string(),
            labels,
            running: true,
        }
    }

    async fn claimed_sandbox_id(store: &Arc<dyn DurableStore>, sandbox_id: &str) -> String {
        let stored = store
            .create(Sandbox::new(
                "default",
                format!("box-{sandbox_id}"),
                SandboxSpec {
                    image: "alpine".to_string(),
                    command: vec![],
                    args: vec![],
                    env: Map::new(),
                    working_dir: String::new(),
                    exposed_ports: vec![],
                    pool_ref: "pool".to_string(),
                    expire_time_unix_nano: None,
                    failure_policy: Default::default(),
                    recovery_timeout_seconds: 0,
                    reset_revision: None,
                },
            ))
            .await
            .unwrap();
        let mut stored = stored;
        stored.sandbox.status.sandbox_id = Some(sandbox_id.to_string());
        store.update(stored).await.unwrap();
        sandbox_id.to_string()
    }

    #[tokio::test]
    async fn fresh_orphan_is_not_reclaimed_immediately() {
        let runtime = Arc::new(FixedRuntime {
            containers: vec![labeled("c1", "uid-1", "sb_1")],
        });
        let store: Arc<dyn DurableStore> = InMemoryStore::new();
        let janitor = Janitor::new(runtime, store, "uid-1");
        janitor.sweep().await;
        assert_eq!(janitor.suspects.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn container_with_a_store_record_is_never_a_suspect() {
        let store: Arc<dyn DurableStore> = InMemoryStore::new();
        claimed_sandbox_id(&store, "sb_1").await;

        let runtime = Arc::new(FixedRuntime {
            containers: vec![labeled("c1", "uid-1", "sb_1")],
        });
        let janitor = Janitor::new(runtime, store, "uid-1");
        janitor.sweep().await;
        assert!(janitor.suspects.lock().await.is_empty());
    }

    #[tokio::test]
    async fn container_from_a_stale_agent_incarnation_is_a_suspect_even_with_a_record() {
        let store: Arc<dyn DurableStore> = InMemoryStore::new();
        claimed_sandbox_id(&store, "sb_1").await;

        let runtime = Arc::new(FixedRuntime {
            containers: vec![labeled("c1", "uid-old", "sb_1")],
        });
        let janitor = Janitor::new(runtime, store, "uid-1");
        janitor.sweep().await;
        assert_eq!(janitor.suspects.lock().await.len(), 1);
    }
}
