//! Container engine abstraction.
//!
//! [`ContainerRuntime`] is the single seam between the orchestration engine and
//! a concrete engine. Every call takes a typed request and returns a typed
//! result; engine-specific text (JSON status dumps, port-binding maps, CLI
//! diagnostics) is translated inside the adapter and never reaches callers.
//!
//! - [`podman`]: drives the `podman` CLI
//! - [`docker`]: drives the Docker engine API via bollard (feature `docker`)
//!
//! The adapter is picked once at startup by [`runtime_for`].

#[cfg(feature = "docker")]
pub mod docker;
pub mod podman;

use crate::config::{NetworkSettings, RestartPolicy};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

/// A failed engine operation, carrying the adapter's raw diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {detail}")]
pub struct RuntimeError {
    /// Operation name, e.g. `create network airpods_network`
    pub operation: String,
    pub detail: String,
}

impl RuntimeError {
    pub fn new(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub name: String,
    pub driver: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
    pub ipv6: bool,
    pub internal: bool,
}

impl NetworkRequest {
    pub fn from_settings(name: impl Into<String>, settings: &NetworkSettings) -> Self {
        Self {
            name: name.into(),
            driver: settings.driver.clone(),
            subnet: settings.subnet.clone(),
            gateway: settings.gateway.clone(),
            dns_servers: settings.dns_servers.clone(),
            ipv6: settings.ipv6,
            internal: settings.internal,
        }
    }
}

/// Pod to create: a shared network namespace owning the published ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRequest {
    pub name: String,
    /// `(host, container)` port pairs
    pub ports: Vec<(u16, u16)>,
    pub network: String,
    /// Aliases for engines that bind them to the pod rather than the container
    pub network_aliases: Vec<String>,
}

/// Container to run (or replace) inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub pod: String,
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// `(source, target)` mounts; an absolute source is a bind mount
    pub volumes: Vec<(String, String)>,
    pub network_aliases: Vec<String>,
    pub gpu: bool,
    /// Engine flag(s) attaching GPUs, used only when `gpu` is set
    pub gpu_device_flag: Option<String>,
    pub restart_policy: RestartPolicy,
    pub memory: Option<String>,
    pub cpus: Option<String>,
}

/// Pod lifecycle state as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodState {
    Running,
    Created,
    Degraded,
    Exited,
    Stopped,
    Dead,
    Other(String),
}

impl PodState {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => PodState::Running,
            "created" => PodState::Created,
            "degraded" => PodState::Degraded,
            "exited" => PodState::Exited,
            "stopped" => PodState::Stopped,
            "dead" => PodState::Dead,
            _ => PodState::Other(status.trim().to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PodState::Running)
    }

    /// The pod will not come up on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodState::Exited | PodState::Stopped | PodState::Dead)
    }
}

impl std::fmt::Display for PodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodState::Running => write!(f, "Running"),
            PodState::Created => write!(f, "Created"),
            PodState::Degraded => write!(f, "Degraded"),
            PodState::Exited => write!(f, "Exited"),
            PodState::Stopped => write!(f, "Stopped"),
            PodState::Dead => write!(f, "Dead"),
            PodState::Other(other) => write!(f, "{}", other),
        }
    }
}

/// One row of a pod listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatusRow {
    pub name: String,
    pub id: String,
    pub state: PodState,
    /// Names of member containers
    pub containers: Vec<String>,
}

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: Option<u16>,
}

/// Structural snapshot of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInspect {
    pub name: String,
    pub state: PodState,
    pub port_bindings: Vec<PortBinding>,
}

/// Log streaming options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Option<u64>,
    pub since: Option<String>,
}

/// Engine operations consumed by the orchestration engine.
///
/// `ensure_*` calls return `true` when something was newly created and are
/// idempotent. Failures carry the adapter's diagnostic text.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Engine name, also the binary checked by environment reports.
    fn name(&self) -> &'static str;

    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create the network unless it exists; an existing one is left untouched.
    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn ensure_volume(&self, name: &str) -> Result<bool>;

    async fn list_volumes(&self) -> Result<Vec<String>>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Local image size in bytes, `None` when the image is absent.
    async fn image_size(&self, image: &str) -> Result<Option<u64>>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    async fn pod_exists(&self, name: &str) -> Result<bool>;

    async fn ensure_pod(&self, request: &PodRequest) -> Result<bool>;

    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Run the container, replacing any existing one with the same name.
    ///
    /// Returns `true` when an existing container was replaced.
    async fn run_container(&self, request: &ContainerRequest) -> Result<bool>;

    /// Stop a pod within `timeout`; a missing pod is not an error.
    async fn stop_pod(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Remove a pod and its containers; a missing pod is not an error.
    async fn remove_pod(&self, name: &str) -> Result<()>;

    async fn pod_status(&self) -> Result<Vec<PodStatusRow>>;

    async fn pod_inspect(&self, name: &str) -> Result<Option<PodInspect>>;

    /// Stream container logs to the terminal, returning the exit code.
    async fn stream_logs(&self, container: &str, options: &LogOptions) -> Result<i32>;
}

/// Select the engine adapter for a runtime preference.
///
/// `auto` and `podman` select Podman; `docker` selects the Docker adapter when
/// the crate is built with the `docker` feature.
pub fn runtime_for(preference: &str) -> Result<Arc<dyn ContainerRuntime>> {
    match preference {
        "auto" | "podman" => {
            info!("Using container runtime: podman");
            Ok(Arc::new(PodmanRuntime::new()))
        }
        "docker" => docker_runtime(),
        other => Err(RuntimeError::new(
            "select runtime",
            format!(
                "Unknown runtime '{}'. Supported runtimes: auto, podman, docker",
                other
            ),
        )),
    }
}

#[cfg(feature = "docker")]
fn docker_runtime() -> Result<Arc<dyn ContainerRuntime>> {
    info!("Using container runtime: docker");
    Ok(Arc::new(DockerRuntime::connect()?))
}

#[cfg(not(feature = "docker"))]
fn docker_runtime() -> Result<Arc<dyn ContainerRuntime>> {
    Err(RuntimeError::new(
        "select runtime",
        "Docker support is not compiled in (enable the `docker` feature)",
    ))
}
