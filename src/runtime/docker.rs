//! Docker engine adapter.
//!
//! Docker has no pods, so one is emulated: a paused infra container named after
//! the pod joins the shared network, owns the published ports and carries the
//! network aliases. Service containers join its network namespace with
//! `network_mode = container:<pod>`. Every container is labelled with
//! [`POD_LABEL`] so a pod can be listed, stopped and removed as a unit.

use super::{
    ContainerRequest, ContainerRuntime, LogOptions, NetworkRequest, PodInspect, PodRequest,
    PodState, PodStatusRow, PortBinding, Result, RuntimeError,
};
use crate::config::RestartPolicy;
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, DeviceRequest, EndpointSettings, HostConfig, Ipam, IpamConfig,
    NetworkCreateRequest, NetworkingConfig, PortBinding as DockerPortBinding,
    RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, InspectNetworkOptions,
    ListContainersOptions, ListVolumesOptions, LogsOptions, RemoveContainerOptions,
    RemoveImageOptions, RemoveVolumeOptions, StartContainerOptions, StopContainerOptions,
};
use futures::stream::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Label naming the pod a container belongs to.
pub const POD_LABEL: &str = "airpods.pod";

/// Label distinguishing the infra container from service containers.
pub const ROLE_LABEL: &str = "airpods.role";

/// Image of the infra container holding a pod's namespaces.
pub const PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.9";

/// Docker engine adapter.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

fn api_error(operation: impl Into<String>, error: bollard::errors::Error) -> RuntimeError {
    RuntimeError::new(operation, error.to_string())
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// 304 Not Modified: container already stopped.
fn is_not_modified(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn restart_policy(policy: RestartPolicy) -> DockerRestartPolicy {
    let name = match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    };
    DockerRestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

/// Parse a `512m` / `4g` style limit into bytes.
pub fn parse_memory(limit: &str) -> Option<i64> {
    let limit = limit.trim();
    let unit = limit.chars().last()?;
    let value: i64 = limit[..limit.len() - unit.len_utf8()].parse().ok()?;
    let multiplier = match unit.to_ascii_lowercase() {
        'k' => 1 << 10,
        'm' => 1 << 20,
        'g' => 1 << 30,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Parse a CPU count into nano-CPUs.
pub fn parse_nano_cpus(cpus: &str) -> Option<i64> {
    let value: f64 = cpus.trim().parse().ok()?;
    (value > 0.0).then(|| (value * 1e9) as i64)
}

/// Parse a log `since` value: epoch seconds or a relative `30s`/`10m`/`2h`.
pub fn parse_since(since: &str, now: SystemTime) -> Option<i32> {
    let since = since.trim();
    if let Ok(epoch) = since.parse::<i32>() {
        return Some(epoch);
    }
    let unit = since.chars().last()?;
    let amount: u64 = since[..since.len() - unit.len_utf8()].parse().ok()?;
    let seconds = match unit {
        's' => amount,
        'm' => amount.saturating_mul(60),
        'h' => amount.saturating_mul(3600),
        _ => return None,
    };
    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i32::try_from(now.saturating_sub(seconds)).ok()
}

/// `(host, container)` pairs → Docker port map.
pub fn port_bindings(ports: &[(u16, u16)]) -> HashMap<String, Option<Vec<DockerPortBinding>>> {
    let mut bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for (host, container) in ports {
        bindings
            .entry(format!("{}/tcp", container))
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(DockerPortBinding {
                host_ip: None,
                host_port: Some(host.to_string()),
            });
    }
    bindings
}

/// List every container, stopped ones included, carrying `label`.
fn label_filter(label: String) -> ListContainersOptions {
    ListContainersOptions {
        all: true,
        filters: Some(HashMap::from([("label".to_string(), vec![label])])),
        ..Default::default()
    }
}

fn container_name(names: &Option<Vec<String>>) -> String {
    names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default()
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns error if no local daemon endpoint can be configured.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| api_error("connect to docker", e))?;
        debug!("Connected to container runtime via local defaults");
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pod_containers(
        &self,
        pod: &str,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        self.docker
            .list_containers(Some(label_filter(format!("{}={}", POD_LABEL, pod))))
            .await
            .map_err(|e| api_error(format!("list containers of pod {}", pod), e))
    }

    async fn ensure_image_present(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => self.pull_image(image).await,
            Err(e) => Err(api_error(format!("inspect image {}", image), e)),
        }
    }

    async fn create_and_start(
        &self,
        name: &str,
        config: ContainerCreateBody,
    ) -> Result<String> {
        let operation = format!("create container {}", name);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| api_error(&operation, e))?;

        self.docker
            .start_container(
                &response.id,
                None::<StartContainerOptions>,
            )
            .await
            .map_err(|e| api_error(format!("start container {}", name), e))?;

        Ok(response.id)
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(api_error(format!("remove container {}", name), e)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(format!("inspect network {}", name), e)),
        }
    }

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool> {
        if self.network_exists(&request.name).await? {
            debug!("Network already exists: {}", request.name);
            return Ok(false);
        }

        let ipam = if request.subnet.is_some() || request.gateway.is_some() {
            Ipam {
                config: Some(vec![IpamConfig {
                    subnet: request.subnet.clone(),
                    gateway: request.gateway.clone(),
                    ..Default::default()
                }]),
                ..Default::default()
            }
        } else {
            Ipam::default()
        };

        if !request.dns_servers.is_empty() {
            warn!(
                "Docker networks do not carry DNS servers; ignoring {:?} for {}",
                request.dns_servers, request.name
            );
        }

        let response = self
            .docker
            .create_network(NetworkCreateRequest {
                name: request.name.clone(),
                driver: Some(request.driver.clone()),
                enable_ipv6: Some(request.ipv6),
                internal: Some(request.internal),
                ipam: Some(ipam),
                ..Default::default()
            })
            .await
            .map_err(|e| api_error(format!("create network {}", request.name), e))?;

        info!(
            "Created network: {} ({})",
            request.name,
            response.id
        );
        Ok(true)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| api_error(format!("remove network {}", name), e))?;
        info!("Removed network: {}", name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(format!("inspect volume {}", name), e)),
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<bool> {
        if self.volume_exists(name).await? {
            return Ok(false);
        }
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                driver: Some("local".to_string()),
                ..Default::default()
            })
            .await
            .map_err(|e| api_error(format!("create volume {}", name), e))?;
        info!("Created volume: {}", name);
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions>)
            .await
            .map_err(|e| api_error("list volumes", e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(
                name,
                Some(RemoveVolumeOptions { force: false }),
            )
            .await
            .map_err(|e| api_error(format!("remove volume {}", name), e))?;
        info!("Removed volume: {}", name);
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        let operation = format!("pull image {}", image);

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(image.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull {}: {}", image, status);
                    }
                    if let Some(error) = info.error {
                        return Err(RuntimeError::new(&operation, error));
                    }
                }
                Err(e) => return Err(api_error(&operation, e)),
            }
        }

        info!("Pulled image: {}", image);
        Ok(())
    }

    async fn image_size(&self, image: &str) -> Result<Option<u64>> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => Ok(inspect.size.and_then(|size| u64::try_from(size).ok())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(api_error(format!("inspect image {}", image), e)),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await
            .map_err(|e| api_error(format!("remove image {}", image), e))?;
        info!("Removed image: {}", image);
        Ok(())
    }

    async fn pod_exists(&self, name: &str) -> Result<bool> {
        self.container_exists(name).await
    }

    async fn ensure_pod(&self, request: &PodRequest) -> Result<bool> {
        if self.pod_exists(&request.name).await? {
            debug!("Pod already exists: {}", request.name);
            return Ok(false);
        }

        self.ensure_image_present(PAUSE_IMAGE).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .ports
            .iter()
            .map(|(_, container)| (format!("{}/tcp", container), HashMap::new()))
            .collect();

        let labels = HashMap::from([
            (POD_LABEL.to_string(), request.name.clone()),
            (ROLE_LABEL.to_string(), "infra".to_string()),
        ]);

        let endpoints = HashMap::from([(
            request.network.clone(),
            EndpointSettings {
                aliases: Some(request.network_aliases.clone()),
                ..Default::default()
            },
        )]);

        let config = ContainerCreateBody {
            image: Some(PAUSE_IMAGE.to_string()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings(&request.ports)),
                network_mode: Some(request.network.clone()),
                restart_policy: Some(restart_policy(RestartPolicy::UnlessStopped)),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        };

        let id = self.create_and_start(&request.name, config).await?;
        info!("Created pod: {} ({})", request.name, id);
        Ok(true)
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(format!("inspect container {}", name), e)),
        }
    }

    async fn run_container(&self, request: &ContainerRequest) -> Result<bool> {
        let existed = self.container_exists(&request.name).await?;
        if existed {
            self.remove_container(&request.name).await?;
        }

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let binds: Vec<String> = request
            .volumes
            .iter()
            .map(|(source, target)| format!("{}:{}", source, target))
            .collect();

        let device_requests = request.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let labels = HashMap::from([
            (POD_LABEL.to_string(), request.pod.clone()),
            (ROLE_LABEL.to_string(), "service".to_string()),
        ]);

        let config = ContainerCreateBody {
            image: Some(request.image.clone()),
            env: (!env.is_empty()).then_some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                network_mode: Some(format!("container:{}", request.pod)),
                restart_policy: Some(restart_policy(request.restart_policy)),
                device_requests,
                memory: request.memory.as_deref().and_then(parse_memory),
                nano_cpus: request.cpus.as_deref().and_then(parse_nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_and_start(&request.name, config).await?;
        if existed {
            info!("Replaced container: {} ({})", request.name, request.image);
        } else {
            info!("Started container: {} ({})", request.name, request.image);
        }
        Ok(existed)
    }

    async fn stop_pod(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut containers = self.pod_containers(name).await?;
        // services first, infra last
        containers.sort_by_key(|c| {
            c.labels
                .as_ref()
                .and_then(|labels| labels.get(ROLE_LABEL))
                .is_some_and(|role| role == "infra")
        });

        let t = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        for container in containers {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .stop_container(
                    &id,
                    Some(StopContainerOptions {
                        t: Some(t),
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {}
                Err(e) if is_not_modified(&e) || is_not_found(&e) => {}
                Err(e) => return Err(api_error(format!("stop pod {}", name), e)),
            }
        }
        info!("Stopped pod: {}", name);
        Ok(())
    }

    async fn remove_pod(&self, name: &str) -> Result<()> {
        for container in self.pod_containers(name).await? {
            if let Some(id) = container.id {
                self.remove_container(&id).await?;
            }
        }
        info!("Removed pod: {}", name);
        Ok(())
    }

    async fn pod_status(&self) -> Result<Vec<PodStatusRow>> {
        let containers = self
            .docker
            .list_containers(Some(label_filter(POD_LABEL.to_string())))
            .await
            .map_err(|e| api_error("list pods", e))?;

        struct Group {
            id: String,
            infra_state: Option<String>,
            all_running: bool,
            containers: Vec<String>,
        }

        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for container in containers {
            let labels = container.labels.clone().unwrap_or_default();
            let Some(pod) = labels.get(POD_LABEL) else {
                continue;
            };
            let state = container
                .state
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default();
            let group = groups.entry(pod.clone()).or_insert_with(|| Group {
                id: String::new(),
                infra_state: None,
                all_running: true,
                containers: Vec::new(),
            });

            group.all_running &= state.eq_ignore_ascii_case("running");
            group.containers.push(container_name(&container.names));
            if labels.get(ROLE_LABEL).is_some_and(|role| role == "infra") {
                group.id = container.id.clone().unwrap_or_default();
                group.infra_state = Some(state);
            }
        }

        Ok(groups
            .into_iter()
            .map(|(name, group)| {
                let state = match group.infra_state.as_deref().map(PodState::parse) {
                    Some(PodState::Running) if !group.all_running => PodState::Degraded,
                    Some(state) => state,
                    None => PodState::Other("no infra container".to_string()),
                };
                PodStatusRow {
                    name,
                    id: group.id,
                    state,
                    containers: group.containers,
                }
            })
            .collect())
    }

    async fn pod_inspect(&self, name: &str) -> Result<Option<PodInspect>> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(api_error(format!("inspect pod {}", name), e)),
        };

        let state = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|status| PodState::parse(&status.to_string()))
            .unwrap_or_else(|| PodState::Other("unknown".to_string()));

        let mut port_bindings = Vec::new();
        let bindings = inspect
            .host_config
            .and_then(|host| host.port_bindings)
            .unwrap_or_default();
        for (key, hosts) in bindings {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            for host in hosts.unwrap_or_default() {
                port_bindings.push(PortBinding {
                    container_port,
                    protocol: protocol.to_string(),
                    host_ip: host.host_ip.unwrap_or_default(),
                    host_port: host.host_port.and_then(|p| p.parse().ok()),
                });
            }
        }
        port_bindings.sort_by_key(|binding| (binding.container_port, binding.host_port));

        Ok(Some(PodInspect {
            name: name.to_string(),
            state,
            port_bindings,
        }))
    }

    async fn stream_logs(&self, container: &str, options: &LogOptions) -> Result<i32> {
        let since = match options.since.as_deref() {
            Some(since) => parse_since(since, SystemTime::now()).unwrap_or_else(|| {
                warn!("Ignoring unparseable log start: {}", since);
                0
            }),
            None => 0,
        };

        let mut stream = self.docker.logs(
            container,
            Some(LogsOptions {
                follow: options.follow,
                stdout: true,
                stderr: true,
                since,
                tail: options
                    .tail
                    .map(|tail| tail.to_string())
                    .unwrap_or_else(|| "all".to_string()),
                ..Default::default()
            }),
        );

        let mut stdout = tokio::io::stdout();
        while let Some(result) = stream.next().await {
            match result {
                Ok(log) => {
                    if stdout.write_all(&log.into_bytes()).await.is_err() {
                        return Ok(1);
                    }
                }
                Err(e) if is_not_found(&e) => return Ok(1),
                Err(e) => return Err(api_error(format!("stream logs {}", container), e)),
            }
        }
        let _ = stdout.flush().await;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("4G"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("1k"), Some(1024));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_parse_nano_cpus() {
        assert_eq!(parse_nano_cpus("2"), Some(2_000_000_000));
        assert_eq!(parse_nano_cpus("0.5"), Some(500_000_000));
        assert_eq!(parse_nano_cpus("0"), None);
        assert_eq!(parse_nano_cpus("many"), None);
    }

    #[test]
    fn test_parse_since() {
        let now = UNIX_EPOCH + Duration::from_secs(10_000);
        assert_eq!(parse_since("1700000000", now), Some(1_700_000_000));
        assert_eq!(parse_since("10m", now), Some(10_000 - 600));
        assert_eq!(parse_since("1h", now), Some(10_000 - 3600));
        assert_eq!(parse_since("yesterday", now), None);
    }

    #[test]
    fn test_label_filter_includes_stopped_containers() {
        let options = label_filter(format!("{}=ollama", POD_LABEL));
        assert!(options.all);
        assert_eq!(
            options.filters,
            Some(HashMap::from([(
                "label".to_string(),
                vec!["airpods.pod=ollama".to_string()]
            )]))
        );
    }

    #[test]
    fn test_port_bindings() {
        let bindings = port_bindings(&[(3000, 8080), (3001, 8080), (11434, 11434)]);
        assert_eq!(bindings.len(), 2);
        let web = bindings["8080/tcp"].as_ref().unwrap();
        let hosts: Vec<_> = web.iter().map(|b| b.host_port.clone().unwrap()).collect();
        assert_eq!(hosts, ["3000", "3001"]);
    }

    #[test]
    fn test_restart_policy_mapping() {
        assert_eq!(
            restart_policy(RestartPolicy::UnlessStopped).name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(
            restart_policy(RestartPolicy::No).name,
            Some(RestartPolicyNameEnum::NO)
        );
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_network_lifecycle() {
        let runtime = DockerRuntime::connect().unwrap();
        let request = NetworkRequest {
            name: format!("airpods-test-{}", std::process::id()),
            driver: "bridge".to_string(),
            subnet: None,
            gateway: None,
            dns_servers: vec![],
            ipv6: false,
            internal: false,
        };

        assert!(runtime.ensure_network(&request).await.unwrap());
        assert!(!runtime.ensure_network(&request).await.unwrap());
        runtime.remove_network(&request.name).await.unwrap();
        assert!(!runtime.network_exists(&request.name).await.unwrap());
    }
}
