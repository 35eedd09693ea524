//! Periodic poll of every known Agent, refreshing the Registry (`spec.md`
//! §4.1, §4.2). Unlike the teacher's push-based heartbeat, Agents never
//! contact the Controller — the Controller polls each Agent's `/state`
//! endpoint on a fixed interval, so a partial network partition only ever
//! stales one agent's entry, never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use fastsandbox_types::model::{AgentInfo, AgentSandboxStatus};
use tracing::{debug, warn};

use crate::agent_client::AgentClient;
use crate::registry::Registry;

/// One statically known Agent pod to poll. In a full deployment this list
/// would come from watching Agent pod objects; `spec.md`'s Non-goals
/// exclude a full Kubernetes-informer integration, so the Controller is
/// configured with a fixed agent roster instead.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub id: String,
    pub namespace: String,
    pub pod_ip: String,
    pub node_name: String,
    pub pool_name: String,
    pub capacity: u32,
}

/// Tunables the control loop polls/evicts with, threaded from
/// `ControllerConfig` rather than hardcoded (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct ControlLoopSettings {
    pub agent_port: u16,
    pub heartbeat_interval: Duration,
    pub stale_agent_timeout: Duration,
}

pub async fn run_control_loop(
    registry: Arc<Registry>,
    endpoints: Vec<AgentEndpoint>,
    settings: ControlLoopSettings,
) {
    let mut interval = tokio::time::interval(settings.heartbeat_interval);
    loop {
        interval.tick().await;
        poll_once(&registry, &endpoints, settings.agent_port).await;
        let lost = registry.evict_stale(settings.stale_agent_timeout).await;
        for id in lost {
            warn!(agent_id = %id, "agent lost: heartbeat aged past threshold");
        }
    }
}

async fn poll_once(registry: &Arc<Registry>, endpoints: &[AgentEndpoint], agent_port: u16) {
    for ep in endpoints {
        let client = AgentClient::new(&ep.pod_ip, agent_port);
        match client.status().await {
            Ok(state) => {
                let sandbox_statuses = state
                    .sandbox_statuses
                    .into_iter()
                    .map(|s| {
                        (
                            s.sandbox_id.clone(),
                            AgentSandboxStatus {
                                phase: s.phase,
                                claim_uid: s.claim_uid,
                                message: s.message,
                                created_at: chrono::Utc::now(),
                            },
                        )
                    })
                    .collect();

                // `allocated`/`used_ports` are Controller-authoritative and
                // ignored by `Registry::upsert` for an already-known agent;
                // these placeholders only seed a never-before-seen one.
                let info = AgentInfo {
                    id: ep.id.clone(),
                    namespace: ep.namespace.clone(),
                    pod_ip: ep.pod_ip.clone(),
                    node_name: ep.node_name.clone(),
                    pool_name: ep.pool_name.clone(),
                    capacity: state.capacity,
                    allocated: 0,
                    used_ports: Default::default(),
                    images: state.images.into_iter().collect(),
                    sandbox_statuses,
                    last_heartbeat: chrono::Utc::now(),
                };
                registry.upsert(info).await;
                debug!(agent_id = %ep.id, "agent state refreshed");
            }
            Err(e) => {
                warn!(agent_id = %ep.id, error = %e, "failed to poll agent state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_once_ignores_unreachable_agents() {
        let registry = Registry::new();
        let endpoints = vec![AgentEndpoint {
            id: "a1".to_string(),
            namespace: "default".to_string(),
            pod_ip: "127.0.0.1".to_string(),
            node_name: "node-1".to_string(),
            pool_name: "pool".to_string(),
            capacity: 4,
        }];
        // Nothing listens on 127.0.0.1:5758 in this test; poll_once must not panic.
        poll_once(&registry, &endpoints, 5758).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn poll_once_preserves_allocation_on_repeat_poll() {
        let registry = Registry::new();
        registry
            .upsert(fastsandbox_types::model::AgentInfo {
                id: "a1".to_string(),
                namespace: "default".to_string(),
                pod_ip: "127.0.0.1".to_string(),
                node_name: "node-1".to_string(),
                pool_name: "pool".to_string(),
                capacity: 4,
                allocated: 2,
                used_ports: std::collections::HashSet::from([8080]),
                images: Default::default(),
                sandbox_statuses: Default::default(),
                last_heartbeat: chrono::Utc::now(),
            })
            .await;

        let endpoints = vec![AgentEndpoint {
            id: "a1".to_string(),
            namespace: "default".to_string(),
            pod_ip: "127.0.0.1".to_string(),
            node_name: "node-1".to_string(),
            pool_name: "pool".to_string(),
            capacity: 4,
        }];
        // Unreachable agent: poll fails, upsert never runs, so the existing
        // allocation state must survive untouched.
        poll_once(&registry, &endpoints, 1).await;

        let handle = registry.get("a1").await.unwrap();
        let info = handle.lock().await;
        assert_eq!(info.allocated, 2);
    }
}
