//! The shared error taxonomy from `spec.md` §7. Each binary converts
//! `CoreError` into its own wire representation at the boundary (an HTTP
//! status + JSON body on the Agent, a `tonic::Status` on the Fast-Path
//! server).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("no agent available for pool {pool_ref}: {reason}")]
    NoAvailableAgent { pool_ref: String, reason: String },

    #[error("agent {agent_id} unreachable: {reason}")]
    AgentUnreachable { agent_id: String, reason: String },

    #[error("store conflict updating {key}")]
    StoreConflict { key: String },

    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("runtime create failed for sandbox {sandbox_id}: {reason}")]
    RuntimeCreateFailed { sandbox_id: String, reason: String },

    #[error("runtime delete failed for sandbox {sandbox_id}: {reason}")]
    RuntimeDeleteFailed { sandbox_id: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}
