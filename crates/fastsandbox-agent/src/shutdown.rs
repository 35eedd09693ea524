use std::sync::Arc;

use tracing::info;

use crate::sandbox_manager::SandboxManager;

pub async fn shutdown(manager: Arc<SandboxManager>) {
    info!("shutdown requested, draining sandboxes");

    manager.destroy_all().await;

    info!("drain complete, exiting");
    std::process::exit(0);
}
