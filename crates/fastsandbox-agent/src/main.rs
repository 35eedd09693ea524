mod config;
mod http_api;
mod janitor;
mod runtime;
mod sandbox_manager;
mod shutdown;

use std::sync::Arc;

use fastsandbox_types::store::{DurableStore, InMemoryStore};
use tracing::info;

use crate::config::AgentConfig;
use crate::http_api::AppState;
use crate::janitor::Janitor;
use crate::runtime::{ContainerEngine, ProcessRuntime};
use crate::sandbox_manager::SandboxManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env();
    let engine = ContainerEngine::from_runtime_type(&config.runtime_type)
        .unwrap_or_else(|| ContainerEngine::detect().unwrap_or(ContainerEngine::Docker));
    let runtime: Arc<dyn runtime::Runtime> =
        Arc::new(ProcessRuntime::new(engine, config.runtime_socket.clone()));
    let manager = SandboxManager::new(config.agent_id.clone(), config.agent_uid.clone(), Arc::clone(&runtime));

    // A production deployment would point this at the same etcd/API-server
    // store the Controller uses; the in-memory store is the only
    // implementation this crate ships.
    let store: Arc<dyn DurableStore> = InMemoryStore::new();

    let janitor = Arc::new(Janitor::new(
        Arc::clone(&runtime),
        Arc::clone(&store),
        config.agent_uid.clone(),
    ));
    tokio::spawn(janitor.run());

    let manager_for_shutdown = Arc::clone(&manager);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown::shutdown(manager_for_shutdown).await;
    });

    let addr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let state = Arc::new(AppState {
        manager,
        capacity: config.capacity,
    });

    info!(
        agent_id = %config.agent_id,
        node_name = %config.node_name,
        pool = %config.pool_name,
        capacity = config.capacity,
        port = config.http_port,
        runtime_type = %config.runtime_type,
        "fast-sandbox agent ready"
    );

    http_api::run_server(addr, state).await?;

    Ok(())
}
