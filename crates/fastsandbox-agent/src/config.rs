//! Agent configuration, read from the environment per `spec.md` §6. No CLI
//! flags here — the Agent runs as a pod sidecar/daemon, injected entirely
//! through its pod spec's env vars, matching the teacher's own
//! `NodeConfig::from_env` shape.
//!
//! `spec.md` §6 names `POD_NAME`, `POD_UID`, `NODE_NAME`, `AGENT_CAPACITY`,
//! `RUNTIME_TYPE`, `RUNTIME_SOCKET`, `CPU_LIMIT`, `MEMORY_LIMIT` and nothing
//! else — no pool name, no HTTP port. `pool_name` has no clean derivation
//! from that list, so it stays a fixed `"default"` until pool-aware
//! multi-tenancy is built; `http_port` is read from an `AGENT_HTTP_PORT`
//! var outside the named list, since the server has to bind somewhere.

pub struct AgentConfig {
    pub agent_id: String,
    pub agent_uid: String,
    pub node_name: String,
    pub pool_name: String,
    pub capacity: u32,
    pub http_port: u16,
    pub runtime_type: String,
    pub runtime_socket: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            agent_id: std::env::var("POD_NAME").unwrap_or_else(|_| format!("agent-{}", uuid::Uuid::new_v4())),
            agent_uid: std::env::var("POD_UID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            node_name: std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown-node".to_string()),
            pool_name: "default".to_string(),
            capacity: std::env::var("AGENT_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),
            http_port: std::env::var("AGENT_HTTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5758),
            runtime_type: std::env::var("RUNTIME_TYPE").unwrap_or_else(|_| "docker".to_string()),
            runtime_socket: std::env::var("RUNTIME_SOCKET").ok(),
            cpu_limit: std::env::var("CPU_LIMIT").ok(),
            memory_limit: std::env::var("MEMORY_LIMIT").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig {
            agent_id: "agent-1".to_string(),
            agent_uid: "uid-1".to_string(),
            node_name: "node-1".to_string(),
            pool_name: "default".to_string(),
            capacity: 8,
            http_port: 5758,
            runtime_type: "docker".to_string(),
            runtime_socket: None,
            cpu_limit: None,
            memory_limit: None,
        }
    }

    #[test]
    fn defaults_are_sane_without_env() {
        let config = sample();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.http_port, 5758);
    }
}
