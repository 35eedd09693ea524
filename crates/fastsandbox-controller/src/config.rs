//! Controller configuration: CLI flags (clap) layered over environment
//! variables, matching `spec.md` §6's env-var table. CLI flags take
//! precedence so operators can override a single field without touching
//! the rest of the environment.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "fastsandbox-controller")]
#[command(about = "Fast-Sandbox control plane: Registry, reconcile loop, and Fast-Path gRPC server")]
#[command(version)]
pub struct ControllerConfig {
    /// Port the Fast-Path gRPC server listens on (`spec.md` §6).
    #[arg(long, env = "FASTSANDBOX_FASTPATH_PORT", default_value_t = 9090)]
    pub fastpath_port: u16,

    /// Port every Agent's HTTP surface listens on.
    #[arg(long, env = "FASTSANDBOX_AGENT_PORT", default_value_t = 5758)]
    pub agent_port: u16,

    /// Fast-Path create consistency mode a client gets when it doesn't
    /// specify one explicitly: `fast` or `strong`.
    #[arg(
        long,
        env = "FASTSANDBOX_FASTPATH_CONSISTENCY_MODE",
        default_value = "fast"
    )]
    pub fastpath_consistency_mode: String,

    /// How long a Fast-mode-created sandbox can go without its durable
    /// record appearing before the Janitor treats it as orphaned.
    #[arg(long, env = "FASTSANDBOX_FASTPATH_ORPHAN_TIMEOUT", default_value_t = 10)]
    pub fastpath_orphan_timeout_secs: u64,

    /// How often the control loop polls each Agent's `/status` endpoint.
    #[arg(long, env = "FASTSANDBOX_HEARTBEAT_INTERVAL", default_value_t = 2)]
    pub heartbeat_interval_secs: u64,

    /// How stale an Agent's heartbeat can get before it's evicted from the
    /// Registry and its sandboxes are marked `Lost`.
    #[arg(long, env = "FASTSANDBOX_STALE_AGENT_TIMEOUT", default_value_t = 300)]
    pub stale_agent_timeout_secs: u64,

    /// Namespace this Controller instance serves.
    #[arg(long, env = "FASTSANDBOX_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Comma-separated `id=pool=ip=node=capacity` agent roster, polled by
    /// the control loop. A full deployment would discover these via the
    /// Kubernetes API; that integration is out of scope here.
    #[arg(long, env = "FASTSANDBOX_AGENTS", value_delimiter = ',')]
    pub agents: Vec<String>,
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::parse()
    }

    pub fn control_loop_settings(&self) -> crate::control_loop::ControlLoopSettings {
        crate::control_loop::ControlLoopSettings {
            agent_port: self.agent_port,
            heartbeat_interval: std::time::Duration::from_secs(self.heartbeat_interval_secs),
            stale_agent_timeout: std::time::Duration::from_secs(self.stale_agent_timeout_secs),
        }
    }

    pub fn parse_agents(&self) -> Vec<crate::control_loop::AgentEndpoint> {
        self.agents
            .iter()
            .filter_map(|entry| {
                let parts: Vec<&str> = entry.split('=').collect();
                if parts.len() != 5 {
                    tracing::warn!(entry, "malformed agent roster entry, skipping");
                    return None;
                }
                Some(crate::control_loop::AgentEndpoint {
                    id: parts[0].to_string(),
                    pool_name: parts[1].to_string(),
                    pod_ip: parts[2].to_string(),
                    node_name: parts[3].to_string(),
                    capacity: parts[4].parse().unwrap_or(0),
                    namespace: self.namespace.clone(),
                })
            })
            .collect()
    }
}
