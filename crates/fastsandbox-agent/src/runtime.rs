//! The Runtime abstraction (`spec.md` §4.4): everything the
//! `SandboxManager` needs from whatever actually runs a sandbox's
//! container. `ProcessRuntime` shells out to `docker`/`podman`/`nerdctl`
//! exactly the way the container-backend fallback in the reference pack
//! does it; `MockRuntime` backs tests without touching a real daemon.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fastsandbox_types::labels::OwnershipLabels;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// How long `destroy` waits after SIGTERM before escalating to SIGKILL
/// (`spec.md` §4.4's three-phase graceful delete).
const GRACE_PERIOD: Duration = Duration::from_secs(10);
const LOG_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RuntimeCreateSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub command: &'a [String],
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub exposed_ports: &'a [u16],
    pub labels: &'a OwnershipLabels,
}

#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    pub container_id: String,
    pub host_ports: HashMap<u16, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    SpawnFailed(String),
    NotFound(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::SpawnFailed(msg) => write!(f, "runtime spawn failed: {msg}"),
            RuntimeError::NotFound(id) => write!(f, "container not found: {id}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Describes one existing container the runtime already owns (surfaced by
/// `list_managed` for the Janitor's reconciliation pass, `spec.md` §4.8).
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub container_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, spec: RuntimeCreateSpec<'_>) -> Result<RuntimeHandle, RuntimeError>;
    /// Graceful delete: SIGTERM, wait up to `GRACE_PERIOD`, SIGKILL
    /// (`spec.md` §4.4). Holding no lock across the wait is the caller's
    /// responsibility — this only shells out, it never blocks on a Mutex.
    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError>;
    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError>;
    async fn get_status(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError>;
    /// Stream log output. `follow` keeps the process (and stream) open
    /// until the container exits or the receiver is dropped.
    async fn get_logs(
        &self,
        container_id: &str,
        follow: bool,
    ) -> Result<ReceiverStream<Result<Vec<u8>, RuntimeError>>, RuntimeError>;
    async fn list_images(&self) -> Result<Vec<String>, RuntimeError>;
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
    /// List every container carrying the `managed=true` ownership label,
    /// regardless of which sandbox it belongs to — the Janitor diffs this
    /// against the durable store's view of what each sandbox ID/claim UID
    /// should still be running.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
    /// Release any runtime-held resources. A no-op for a CLI-driven runtime
    /// with no persistent connection; present so the trait matches
    /// `spec.md` §4.4's contract.
    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    Docker,
    Podman,
    Nerdctl,
}

impl ContainerEngine {
    pub fn cmd(&self) -> &'static str {
        match self {
            ContainerEngine::Docker => "docker",
            ContainerEngine::Podman => "podman",
            ContainerEngine::Nerdctl => "nerdctl",
        }
    }

    /// Map `RUNTIME_TYPE` onto an engine. Unrecognized values fall back to
    /// `detect_or_docker` at the call site rather than here.
    pub fn from_runtime_type(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "docker" => Some(ContainerEngine::Docker),
            "podman" => Some(ContainerEngine::Podman),
            "nerdctl" => Some(ContainerEngine::Nerdctl),
            _ => None,
        }
    }

    /// Prefer Podman (rootless, daemonless) when both are on `$PATH`.
    pub fn detect() -> Option<Self> {
        if which_available("podman") {
            Some(ContainerEngine::Podman)
        } else if which_available("docker") {
            Some(ContainerEngine::Docker)
        } else {
            None
        }
    }
}

fn which_available(bin: &str) -> bool {
    std::process::Command::new("which")
        .arg(bin)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Shells out to a container engine CLI for sandbox lifecycle operations.
pub struct ProcessRuntime {
    engine: ContainerEngine,
    socket: Option<String>,
}

impl ProcessRuntime {
    pub fn new(engine: ContainerEngine, socket: Option<String>) -> Self {
        Self { engine, socket }
    }

    pub fn detect_or_docker() -> Self {
        Self::new(ContainerEngine::detect().unwrap_or(ContainerEngine::Docker), None)
    }

    /// Base command with `-H` pointed at `RUNTIME_SOCKET`, if one was given.
    fn command(&self) -> Command {
        let mut cmd = Command::new(self.engine.cmd());
        if let Some(socket) = &self.socket {
            cmd.args(["-H", socket]);
        }
        cmd
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn create(&self, spec: RuntimeCreateSpec<'_>) -> Result<RuntimeHandle, RuntimeError> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.container_name.to_string(),
        ];

        for (key, value) in spec.labels.as_pairs() {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in spec.exposed_ports {
            args.push("-p".to_string());
            args.push(format!("{port}"));
        }

        args.push(spec.image.to_string());
        args.extend(spec.command.iter().cloned());
        args.extend(spec.args.iter().cloned());

        info!(container = spec.container_name, engine = self.engine.cmd(), "starting container");

        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::SpawnFailed(stderr.trim().to_string()));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let host_ports = self.resolve_host_ports(&container_id, spec.exposed_ports).await;

        Ok(RuntimeHandle {
            container_id,
            host_ports,
        })
    }

    /// Three phases, matching `spec.md` §4.4: SIGTERM, wait up to
    /// `GRACE_PERIOD` polling `is_running` (no lock held during the wait —
    /// the caller only holds one across phases 1 and 3), then SIGKILL via
    /// `rm -f` if it's still alive.
    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError> {
        let term = self
            .command()
            .args(["kill", "-s", "SIGTERM", container_id])
            .output()
            .await;
        if let Ok(output) = &term {
            if !output.status.success() {
                debug!(container_id, "SIGTERM kill failed, container may already be stopped");
            }
        }

        let deadline = tokio::time::Instant::now() + GRACE_PERIOD;
        while tokio::time::Instant::now() < deadline {
            match self.is_running(container_id).await {
                Ok(true) => tokio::time::sleep(Duration::from_millis(200)).await,
                _ => break,
            }
        }

        let output = self
            .command()
            .args(["rm", "-f", container_id])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container_id, error = %stderr, "container removal reported an error");
        }
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        let output = self
            .command()
            .args(["inspect", "-f", "{{.State.Running}}", container_id])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn get_status(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        let output = self
            .command()
            .args(["inspect", "-f", "{{.State.Status}}", container_id])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        Ok(match String::from_utf8_lossy(&output.stdout).trim() {
            "running" => ContainerStatus::Running,
            "exited" | "dead" => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        })
    }

    async fn get_logs(
        &self,
        container_id: &str,
        follow: bool,
    ) -> Result<ReceiverStream<Result<Vec<u8>, RuntimeError>>, RuntimeError> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        let mut stdout = child.stdout.take().expect("stdout was piped");

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut buf = [0u8; LOG_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RuntimeError::SpawnFailed(e.to_string()))).await;
                        break;
                    }
                }
            }
            let _ = child.wait().await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .command()
            .args(["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::SpawnFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let output = self
            .command()
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::SpawnFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let output = self
            .command()
            .args([
                "ps",
                "-a",
                "--filter",
                &format!("label={}=true", fastsandbox_types::labels::MANAGED),
                "--format",
                "{{.ID}}\t{{.State}}\t{{.Labels}}",
            ])
            .output()
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::SpawnFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let mut containers = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.splitn(3, '\t');
            let Some(id) = parts.next() else { continue };
            let running = parts.next().map(|s| s == "running").unwrap_or(false);
            let labels = parts
                .next()
                .map(parse_docker_labels)
                .unwrap_or_default();
            containers.push(ManagedContainer {
                container_id: id.to_string(),
                labels,
                running,
            });
        }
        Ok(containers)
    }
}

impl ProcessRuntime {
    async fn resolve_host_ports(&self, container_id: &str, exposed_ports: &[u16]) -> HashMap<u16, u16> {
        let mut host_ports = HashMap::new();
        for port in exposed_ports {
            let output = self
                .command()
                .args(["port", container_id, &port.to_string()])
                .output()
                .await;
            if let Ok(output) = output {
                if output.status.success() {
                    if let Some(host_port) = parse_host_port(&String::from_utf8_lossy(&output.stdout)) {
                        host_ports.insert(*port, host_port);
                    }
                }
            }
        }
        host_ports
    }
}

/// Parse docker/podman's `--format '{{.Labels}}'` output: a comma-separated
/// `k=v` list.
fn parse_docker_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_host_port(text: &str) -> Option<u16> {
    text.trim().rsplit(':').next()?.parse().ok()
}

/// In-memory stand-in used by tests: tracks "running" containers without
/// ever touching a real container engine.
pub struct MockRuntime {
    containers: tokio::sync::Mutex<HashMap<String, bool>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create(&self, spec: RuntimeCreateSpec<'_>) -> Result<RuntimeHandle, RuntimeError> {
        let container_id = format!("mock-{}", spec.container_name);
        self.containers
            .lock()
            .await
            .insert(container_id.clone(), true);
        let host_ports = spec.exposed_ports.iter().map(|p| (*p, *p)).collect();
        Ok(RuntimeHandle {
            container_id,
            host_ports,
        })
    }

    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn get_status(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        match self.containers.lock().await.get(container_id) {
            Some(true) => Ok(ContainerStatus::Running),
            Some(false) => Ok(ContainerStatus::Exited),
            None => Err(RuntimeError::NotFound(container_id.to_string())),
        }
    }

    async fn get_logs(
        &self,
        container_id: &str,
        _follow: bool,
    ) -> Result<ReceiverStream<Result<Vec<u8>, RuntimeError>>, RuntimeError> {
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(b"mock log output\n".to_vec())).await;
        Ok(ReceiverStream::new(rx))
    }

    async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(vec!["alpine:latest".to_string()])
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .await
            .iter()
            .map(|(id, running)| ManagedContainer {
                container_id: id.clone(),
                labels: HashMap::new(),
                running: *running,
            })
            .collect())
    }
}
