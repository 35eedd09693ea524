pub mod error;
pub mod labels;
pub mod model;
pub mod store;

pub use error::CoreError;
pub use model::{
    AgentInfo, Condition, Endpoint, FailurePolicy, Sandbox, SandboxPhase, SandboxPool,
    SandboxSpec, SandboxStatus,
};
pub use store::{DurableStore, InMemoryStore, StoreError, StoreEvent, StoredSandbox};
