//! Container labels applied to physical containers (`spec.md` §6). These are
//! the only cross-restart binding the Janitor has to identify what it
//! manages — losing one is the difference between reclaiming and orphaning.

pub const MANAGED: &str = "managed";
pub const AGENT_NAME: &str = "agent-name";
pub const AGENT_UID: &str = "agent-uid";
pub const NAMESPACE: &str = "namespace";
pub const SANDBOX_ID: &str = "id";
pub const CLAIM_UID: &str = "claim-uid";
pub const SANDBOX_NAME: &str = "sandbox-name";

/// Labels to stamp on a newly created container, matching the Runtime
/// abstraction's ownership contract (`spec.md` §4.4).
#[derive(Debug, Clone)]
pub struct OwnershipLabels {
    pub agent_name: String,
    pub agent_uid: String,
    pub namespace: String,
    pub sandbox_id: String,
    pub claim_uid: String,
    pub sandbox_name: String,
}

impl OwnershipLabels {
    pub fn as_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (MANAGED, "true".to_string()),
            (AGENT_NAME, self.agent_name.clone()),
            (AGENT_UID, self.agent_uid.clone()),
            (NAMESPACE, self.namespace.clone()),
            (SANDBOX_ID, self.sandbox_id.clone()),
            (CLAIM_UID, self.claim_uid.clone()),
            (SANDBOX_NAME, self.sandbox_name.clone()),
        ]
    }
}
