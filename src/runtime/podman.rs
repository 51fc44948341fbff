//! Podman CLI adapter.
//!
//! Every engine call is one `podman` invocation built by a pure argument
//! builder (unit-tested below) and executed with `tokio::process::Command`.
//! JSON output from `pod ps` and `pod inspect` is decoded here into typed rows.

use super::{
    ContainerRequest, ContainerRuntime, LogOptions, NetworkRequest, PodInspect, PodRequest,
    PodState, PodStatusRow, PortBinding, Result, RuntimeError,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Podman engine adapter.
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PodmanRuntime {
    /// Adapter invoking `podman` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: "podman".to_string(),
        }
    }

    /// Use a specific podman binary.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.binary.as_str())
            .chain(args.iter().map(String::as_str))
            .map(|part| shell_escape::escape(Cow::Borrowed(part)).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn output(&self, operation: &str, args: &[String]) -> Result<Output> {
        debug!("Running: {}", self.command_line(args));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::new(operation, format!("failed to run {}: {}", self.binary, e)))
    }

    /// Run a command that must succeed, returning its stdout.
    async fn run(&self, operation: &str, args: Vec<String>) -> Result<String> {
        let output = self.output(operation, &args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(RuntimeError::new(operation, diagnostic(&output)))
        }
    }

    /// Run an existence check; a non-zero exit means "absent".
    async fn exists(&self, operation: &str, args: Vec<String>) -> Result<bool> {
        let output = self.output(operation, &args).await?;
        Ok(output.status.success())
    }
}

/// Diagnostic text of a failed command: stderr, else stdout, else the status.
fn diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("exited with {}", output.status)
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

pub fn network_create_args(request: &NetworkRequest) -> Vec<String> {
    let mut args = args(["network", "create", "--driver", &request.driver]);
    if let Some(subnet) = &request.subnet {
        args.extend(["--subnet".to_string(), subnet.clone()]);
    }
    if let Some(gateway) = &request.gateway {
        args.extend(["--gateway".to_string(), gateway.clone()]);
    }
    for dns in &request.dns_servers {
        args.extend(["--dns".to_string(), dns.clone()]);
    }
    if request.ipv6 {
        args.push("--ipv6".to_string());
    }
    if request.internal {
        args.push("--internal".to_string());
    }
    args.push(request.name.clone());
    args
}

pub fn pod_create_args(request: &PodRequest) -> Vec<String> {
    let mut args = args([
        "pod",
        "create",
        "--name",
        &request.name,
        "--network",
        &request.network,
    ]);
    for (host, container) in &request.ports {
        args.extend(["-p".to_string(), format!("{}:{}", host, container)]);
    }
    args
}

pub fn run_args(request: &ContainerRequest) -> Vec<String> {
    let mut args = args([
        "run",
        "--detach",
        "--replace",
        "--name",
        &request.name,
        "--pod",
        &request.pod,
        "--restart",
        request.restart_policy.as_str(),
    ]);
    for alias in &request.network_aliases {
        args.extend(["--network-alias".to_string(), alias.clone()]);
    }
    for (key, value) in &request.env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }
    for (source, target) in &request.volumes {
        args.extend(["-v".to_string(), format!("{}:{}", source, target)]);
    }
    if let Some(memory) = &request.memory {
        args.extend(["--memory".to_string(), memory.clone()]);
    }
    if let Some(cpus) = &request.cpus {
        args.extend(["--cpus".to_string(), cpus.clone()]);
    }
    if request.gpu
        && let Some(flag) = &request.gpu_device_flag
    {
        args.extend(flag.split_whitespace().map(str::to_string));
    }
    args.push(request.image.clone());
    args
}

pub fn stop_pod_args(name: &str, timeout: Duration) -> Vec<String> {
    args([
        "pod",
        "stop",
        "--ignore",
        &format!("--time={}", timeout.as_secs()),
        name,
    ])
}

pub fn remove_pod_args(name: &str) -> Vec<String> {
    args(["pod", "rm", "--force", "--ignore", name])
}

pub fn logs_args(container: &str, options: &LogOptions) -> Vec<String> {
    let mut args = args(["logs"]);
    if options.follow {
        args.push("--follow".to_string());
    }
    if let Some(tail) = options.tail {
        args.extend(["--tail".to_string(), tail.to_string()]);
    }
    if let Some(since) = &options.since {
        args.extend(["--since".to_string(), since.clone()]);
    }
    args.push(container.to_string());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsContainer {
    #[serde(default)]
    names: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsPod {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    containers: Vec<PsContainer>,
}

fn malformed(operation: impl Into<String>, error: serde_json::Error) -> RuntimeError {
    RuntimeError::new(operation, format!("unexpected podman output: {}", error))
}

/// Decode `podman pod ps --format json`.
pub fn parse_pod_ps(json: &str) -> Result<Vec<PodStatusRow>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let pods: Vec<PsPod> =
        serde_json::from_str(json).map_err(|e| malformed("list pods", e))?;
    Ok(pods
        .into_iter()
        .map(|pod| PodStatusRow {
            state: PodState::parse(&pod.status),
            containers: pod.containers.into_iter().map(|c| c.names).collect(),
            name: pod.name,
            id: pod.id,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InfraConfig {
    #[serde(default)]
    port_bindings: Option<BTreeMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPod {
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    infra_config: Option<InfraConfig>,
}

/// Split a `8080/tcp` port key.
fn parse_port_key(key: &str) -> Option<(u16, String)> {
    let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
    Some((port.parse().ok()?, protocol.to_string()))
}

/// Decode `podman pod inspect` output (an object, or a one-element array).
pub fn parse_pod_inspect(name: &str, json: &str) -> Result<Option<PodInspect>> {
    let operation = || format!("inspect pod {}", name);
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| malformed(operation(), e))?;
    let value = match value {
        serde_json::Value::Array(mut items) => {
            if items.is_empty() {
                return Ok(None);
            }
            items.swap_remove(0)
        }
        other => other,
    };
    let pod: InspectPod = serde_json::from_value(value).map_err(|e| malformed(operation(), e))?;

    let mut port_bindings = Vec::new();
    let bindings = pod
        .infra_config
        .and_then(|infra| infra.port_bindings)
        .unwrap_or_default();
    for (key, hosts) in bindings {
        let Some((container_port, protocol)) = parse_port_key(&key) else {
            continue;
        };
        for host in hosts.unwrap_or_default() {
            port_bindings.push(PortBinding {
                container_port,
                protocol: protocol.clone(),
                host_ip: host.host_ip,
                host_port: host.host_port.parse().ok(),
            });
        }
    }

    Ok(Some(PodInspect {
        name: pod.name,
        state: PodState::parse(&pod.state),
        port_bindings,
    }))
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            &format!("inspect network {}", name),
            args(["network", "inspect", name]),
        )
        .await
    }

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool> {
        if self.network_exists(&request.name).await? {
            debug!("Network already exists: {}", request.name);
            return Ok(false);
        }
        self.run(
            &format!("create network {}", request.name),
            network_create_args(request),
        )
        .await?;
        info!("Created network: {} ({})", request.name, request.driver);
        Ok(true)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run(
            &format!("remove network {}", name),
            args(["network", "rm", name]),
        )
        .await?;
        info!("Removed network: {}", name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            &format!("inspect volume {}", name),
            args(["volume", "inspect", name]),
        )
        .await
    }

    async fn ensure_volume(&self, name: &str) -> Result<bool> {
        if self.volume_exists(name).await? {
            return Ok(false);
        }
        self.run(
            &format!("create volume {}", name),
            args(["volume", "create", name]),
        )
        .await?;
        info!("Created volume: {}", name);
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(
                "list volumes",
                args(["volume", "ls", "--format", "{{.Name}}"]),
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run(
            &format!("remove volume {}", name),
            args(["volume", "rm", name]),
        )
        .await?;
        info!("Removed volume: {}", name);
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        self.run(&format!("pull image {}", image), args(["pull", image]))
            .await?;
        info!("Pulled image: {}", image);
        Ok(())
    }

    async fn image_size(&self, image: &str) -> Result<Option<u64>> {
        let operation = format!("inspect image {}", image);
        let output = self
            .output(
                &operation,
                &args(["image", "inspect", "--format", "{{.Size}}", image]),
            )
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.trim().parse().ok())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.run(&format!("remove image {}", image), args(["rmi", image]))
            .await?;
        info!("Removed image: {}", image);
        Ok(())
    }

    async fn pod_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            &format!("inspect pod {}", name),
            args(["pod", "inspect", name]),
        )
        .await
    }

    async fn ensure_pod(&self, request: &PodRequest) -> Result<bool> {
        if self.pod_exists(&request.name).await? {
            debug!("Pod already exists: {}", request.name);
            return Ok(false);
        }
        self.run(
            &format!("create pod {}", request.name),
            pod_create_args(request),
        )
        .await?;
        info!("Created pod: {}", request.name);
        Ok(true)
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            &format!("inspect container {}", name),
            args(["container", "inspect", name]),
        )
        .await
    }

    async fn run_container(&self, request: &ContainerRequest) -> Result<bool> {
        let existed = self.container_exists(&request.name).await?;
        self.run(
            &format!("start container {}", request.name),
            run_args(request),
        )
        .await?;
        if existed {
            info!("Replaced container: {} ({})", request.name, request.image);
        } else {
            info!("Started container: {} ({})", request.name, request.image);
        }
        Ok(existed)
    }

    async fn stop_pod(&self, name: &str, timeout: Duration) -> Result<()> {
        self.run(&format!("stop pod {}", name), stop_pod_args(name, timeout))
            .await?;
        info!("Stopped pod: {}", name);
        Ok(())
    }

    async fn remove_pod(&self, name: &str) -> Result<()> {
        self.run(&format!("remove pod {}", name), remove_pod_args(name))
            .await?;
        info!("Removed pod: {}", name);
        Ok(())
    }

    async fn pod_status(&self) -> Result<Vec<PodStatusRow>> {
        let stdout = self
            .run("list pods", args(["pod", "ps", "--format", "json"]))
            .await?;
        parse_pod_ps(&stdout)
    }

    async fn pod_inspect(&self, name: &str) -> Result<Option<PodInspect>> {
        let operation = format!("inspect pod {}", name);
        let output = self
            .output(&operation, &args(["pod", "inspect", name]))
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_pod_inspect(name, &stdout)
    }

    async fn stream_logs(&self, container: &str, options: &LogOptions) -> Result<i32> {
        let args = logs_args(container, options);
        debug!("Running: {}", self.command_line(&args));
        let status = Command::new(&self.binary)
            .args(&args)
            .status()
            .await
            .map_err(|e| {
                RuntimeError::new(
                    format!("stream logs {}", container),
                    format!("failed to run {}: {}", self.binary, e),
                )
            })?;
        Ok(status.code().unwrap_or(-1))
    }
}
