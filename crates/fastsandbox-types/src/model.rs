//! Durable and in-memory data model shared by the Controller and the Agent.
//!
//! `Sandbox` is the durable record (serde JSON on the wire, stored in a
//! `DurableStore`); `AgentInfo` is the Registry's in-memory view of one
//! Agent. Both cross process boundaries as plain JSON, so field names here
//! are exactly the wire field names (see `spec.md` §6).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cleanup finalizer marker placed on every Sandbox until the Controller has
/// confirmed the Agent-side resources are gone.
pub const CLEANUP_FINALIZER: &str = "cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    Manual,
    AutoRecreate,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxPhase {
    Pending,
    Bound,
    Running,
    Terminating,
    Expired,
    Failed,
    Lost,
}

impl Default for SandboxPhase {
    fn default() -> Self {
        SandboxPhase::Pending
    }
}

impl SandboxPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxPhase::Expired | SandboxPhase::Failed)
    }
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Bound => "Bound",
            SandboxPhase::Running => "Running",
            SandboxPhase::Terminating => "Terminating",
            SandboxPhase::Expired => "Expired",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Lost => "Lost",
        };
        write!(f, "{s}")
    }
}

/// The phase an Agent reports for one of its tracked sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentReportedPhase {
    Creating,
    Running,
    Terminating,
    Failed,
    Stopped,
}

impl AgentReportedPhase {
    /// Maps an Agent-reported phase into a durable phase, per `spec.md` §3.
    /// `in_deletion_flow` distinguishes an absent sandbox mid-delete
    /// (Terminating) from one whose Agent has vanished entirely (handled
    /// separately by the reconciler's agent-lost path, not this mapping).
    pub fn to_durable(self) -> SandboxPhase {
        match self {
            AgentReportedPhase::Creating => SandboxPhase::Bound,
            AgentReportedPhase::Running => SandboxPhase::Running,
            AgentReportedPhase::Failed | AgentReportedPhase::Stopped => SandboxPhase::Failed,
            AgentReportedPhase::Terminating => SandboxPhase::Terminating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    pub pool_ref: String,
    /// Unix-nano expiry; `None` means no expiry.
    #[serde(default)]
    pub expire_time_unix_nano: Option<i64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub recovery_timeout_seconds: u64,
    #[serde(default)]
    pub reset_revision: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default)]
    pub assigned_pod: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub accepted_reset_revision: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Annotation that carries Fast-mode allocation handoff data (`spec.md` §4.6).
pub const ANNOTATION_ALLOCATION: &str = "sandbox.fast.io/allocation";
/// Annotation persisting the Fast-mode creation timestamp for sandboxID regeneration.
pub const ANNOTATION_CREATE_TIMESTAMP: &str = "sandbox.fast.io/createTimestamp";
/// Label marking Fast-mode-created objects.
pub const LABEL_CREATED_BY: &str = "sandbox.fast.io/created-by";
pub const CREATED_BY_FASTPATH_FAST: &str = "fastpath-fast";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationAnnotation {
    pub assigned_pod: String,
    pub assigned_node: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: Option<String>,
    pub spec: SandboxSpec,
    #[serde(default)]
    pub status: SandboxStatus,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Sandbox {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: SandboxSpec) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: None,
            spec,
            status: SandboxStatus::default(),
            annotations: HashMap::new(),
            labels: HashMap::new(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == CLEANUP_FINALIZER)
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers.push(CLEANUP_FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        self.finalizers.retain(|f| f != CLEANUP_FINALIZER);
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn is_expired(&self, now_unix_nano: i64) -> bool {
        matches!(self.spec.expire_time_unix_nano, Some(t) if now_unix_nano > t)
    }

    pub fn is_fast_mode(&self) -> bool {
        self.labels.get(LABEL_CREATED_BY).map(String::as_str) == Some(CREATED_BY_FASTPATH_FAST)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPool {
    pub name: String,
    pub namespace: String,
    pub min_pods: u32,
    pub max_pods: u32,
    pub per_agent_capacity: u32,
    pub runtime_kind: String,
}

/// Snapshot of one sandbox as last reported by its Agent (§3, Agent-owned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSandboxStatus {
    pub phase: AgentReportedPhase,
    pub claim_uid: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Registry's in-memory, authoritative view of one Agent (§3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub namespace: String,
    pub pod_ip: String,
    pub node_name: String,
    pub pool_name: String,
    pub capacity: u32,
    pub allocated: u32,
    pub used_ports: HashSet<u16>,
    pub images: HashSet<String>,
    pub sandbox_statuses: HashMap<String, AgentSandboxStatus>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentInfo {
    pub fn has_capacity(&self) -> bool {
        self.allocated < self.capacity
    }

    pub fn ports_free(&self, ports: &[u16]) -> bool {
        ports.iter().all(|p| !self.used_ports.contains(p))
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.contains(image)
    }
}
