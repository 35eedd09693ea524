pub mod agent_client;
pub mod config;
pub mod control_loop;
pub mod fastpath;
pub mod reconciler;
pub mod registry;
pub mod sandbox_id;

use std::sync::Arc;

use fastsandbox_types::store::{DurableStore, InMemoryStore};
use tracing::info;

use crate::config::ControllerConfig;
use crate::fastpath::proto::fast_path_server::FastPathServer;
use crate::fastpath::FastPathService;
use crate::reconciler::Reconciler;
use crate::registry::Registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env();
    let registry = Registry::new();

    // A production deployment would swap this for a real DurableStore
    // (etcd, the Kubernetes API server); the in-memory store is the only
    // implementation this crate ships.
    let store: Arc<dyn DurableStore> = InMemoryStore::new();

    if let Err(e) = registry.restore(store.as_ref()).await {
        tracing::warn!(error = %e, "registry restore from durable store failed, starting with a clean allocation view");
    }

    let agent_endpoints = config.parse_agents();
    info!(count = agent_endpoints.len(), "loaded agent roster");
    tokio::spawn(control_loop::run_control_loop(
        Arc::clone(&registry),
        agent_endpoints,
        config.control_loop_settings(),
    ));

    let reconciler = Arc::new(Reconciler::with_agent_port(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.agent_port,
    ));
    tokio::spawn(Arc::clone(&reconciler).run());

    let addr = format!("0.0.0.0:{}", config.fastpath_port).parse()?;
    let service = FastPathService::new(store, registry, config.agent_port);

    info!(port = config.fastpath_port, "fast-sandbox controller ready");

    tonic::transport::Server::builder()
        .add_service(FastPathServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
