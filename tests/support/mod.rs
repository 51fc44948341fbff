//! Shared test doubles: an in-memory container engine, a scripted system
//! inspector and a scripted health checker.

#![allow(dead_code)]

use airpods::config::{NetworkSettings, RestartPolicy};
use airpods::runtime::{
    ContainerRequest, ContainerRuntime, LogOptions, NetworkRequest, PodInspect, PodRequest,
    PodState, PodStatusRow, PortBinding, Result, RuntimeError,
};
use airpods::services::{ManagerSettings, ServiceRegistry, ServiceSpec, StartupOptions};
use airpods::services::{HealthChecker, ServiceManager};
use airpods::system::{CheckResult, GpuDetection, SystemInspector};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

/// Engine state plus a log of every mutating request.
#[derive(Debug, Default)]
pub struct EngineState {
    pub networks: BTreeMap<String, NetworkRequest>,
    pub volumes: BTreeSet<String>,
    pub images: BTreeMap<String, u64>,
    pub pods: BTreeMap<String, PodState>,
    /// container name → pod name
    pub containers: BTreeMap<String, String>,

    pub pod_requests: Vec<PodRequest>,
    pub container_requests: Vec<ContainerRequest>,
    pub pulls_started: Vec<String>,
    pub stopped: Vec<String>,
    pub removed_pods: Vec<String>,
    pub failing_pulls: HashSet<String>,
    /// Per-image pull delay, overriding the runtime-wide one
    pub slow_pulls: BTreeMap<String, Duration>,
    /// Pods whose state is pinned regardless of lifecycle calls
    pub pinned_states: BTreeMap<String, PodState>,
}

/// In-memory [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<EngineState>,
    pull_delay: Duration,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: delay,
            ..Self::default()
        }
    }

    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn fail_pull(&self, image: &str) {
        self.state().failing_pulls.insert(image.to_string());
    }

    pub fn slow_pull(&self, image: &str, delay: Duration) {
        self.state().slow_pulls.insert(image.to_string(), delay);
    }

    pub fn pin_pod_state(&self, pod: &str, state: PodState) {
        self.state().pinned_states.insert(pod.to_string(), state);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().networks.contains_key(name))
    }

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool> {
        let mut state = self.state();
        if state.networks.contains_key(&request.name) {
            return Ok(false);
        }
        state.networks.insert(request.name.clone(), request.clone());
        Ok(true)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.state().networks.remove(name);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().volumes.contains(name))
    }

    async fn ensure_volume(&self, name: &str) -> Result<bool> {
        Ok(self.state().volumes.insert(name.to_string()))
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        Ok(self.state().volumes.iter().cloned().collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        if self.state().volumes.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::new(
                format!("remove volume {}", name),
                "no such volume",
            ))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.pulls_started.push(image.to_string());
            state
                .slow_pulls
                .get(image)
                .copied()
                .unwrap_or(self.pull_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_pulls.contains(image) {
            return Err(RuntimeError::new(
                format!("pull image {}", image),
                "manifest unknown",
            ));
        }
        state.images.insert(image.to_string(), 1024);
        Ok(())
    }

    async fn image_size(&self, image: &str) -> Result<Option<u64>> {
        Ok(self.state().images.get(image).copied())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.state().images.remove(image);
        Ok(())
    }

    async fn pod_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().pods.contains_key(name))
    }

    async fn ensure_pod(&self, request: &PodRequest) -> Result<bool> {
        let mut state = self.state();
        if state.pods.contains_key(&request.name) {
            return Ok(false);
        }
        state.pods.insert(request.name.clone(), PodState::Created);
        state.pod_requests.push(request.clone());
        Ok(true)
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().containers.contains_key(name))
    }

    async fn run_container(&self, request: &ContainerRequest) -> Result<bool> {
        let mut state = self.state();
        if !state.pods.contains_key(&request.pod) {
            return Err(RuntimeError::new(
                format!("run container {}", request.name),
                format!("no pod with name or ID {} found", request.pod),
            ));
        }
        let replaced = state
            .containers
            .insert(request.name.clone(), request.pod.clone())
            .is_some();
        state.pods.insert(request.pod.clone(), PodState::Running);
        state.container_requests.push(request.clone());
        Ok(replaced)
    }

    async fn stop_pod(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state();
        if let Some(pod) = state.pods.get_mut(name) {
            *pod = PodState::Exited;
        }
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn remove_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.pods.remove(name);
        state.containers.retain(|_, pod| pod.as_str() != name);
        state.removed_pods.push(name.to_string());
        Ok(())
    }

    async fn pod_status(&self) -> Result<Vec<PodStatusRow>> {
        let state = self.state();
        Ok(state
            .pods
            .iter()
            .map(|(name, pod_state)| PodStatusRow {
                name: name.clone(),
                id: format!("id-{}", name),
                state: state
                    .pinned_states
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| pod_state.clone()),
                containers: state
                    .containers
                    .iter()
                    .filter(|(_, pod)| *pod == name)
                    .map(|(container, _)| container.clone())
                    .collect(),
            })
            .collect())
    }

    async fn pod_inspect(&self, name: &str) -> Result<Option<PodInspect>> {
        let state = self.state();
        let Some(pod_state) = state.pods.get(name) else {
            return Ok(None);
        };
        let port_bindings = state
            .pod_requests
            .iter()
            .filter(|request| request.name == name)
            .flat_map(|request| request.ports.iter())
            .map(|(host, container)| PortBinding {
                container_port: *container,
                protocol: "tcp".to_string(),
                host_ip: "0.0.0.0".to_string(),
                host_port: Some(*host),
            })
            .collect();
        Ok(Some(PodInspect {
            name: name.to_string(),
            state: pod_state.clone(),
            port_bindings,
        }))
    }

    async fn stream_logs(&self, container: &str, _options: &LogOptions) -> Result<i32> {
        Ok(if self.state().containers.contains_key(container) {
            0
        } else {
            125
        })
    }
}

/// [`SystemInspector`] with fixed answers.
#[derive(Debug, Clone)]
pub struct FakeSystem {
    pub missing: Vec<String>,
    pub gpu: GpuDetection,
}

impl FakeSystem {
    pub fn healthy() -> Self {
        Self {
            missing: Vec::new(),
            gpu: GpuDetection::unavailable("nvidia-smi not found"),
        }
    }

    pub fn missing(names: &[&str]) -> Self {
        Self {
            missing: names.iter().map(|name| name.to_string()).collect(),
            ..Self::healthy()
        }
    }
}

#[async_trait]
impl SystemInspector for FakeSystem {
    async fn check_dependency(&self, name: &str) -> CheckResult {
        if self.missing.iter().any(|missing| missing == name) {
            CheckResult::missing(name, "not found")
        } else {
            CheckResult::ok(name, format!("{} version 1.0", name))
        }
    }

    async fn detect_gpu(&self) -> GpuDetection {
        self.gpu.clone()
    }
}

/// [`HealthChecker`] answering with a fixed status and recording every URL.
#[derive(Debug, Default)]
pub struct FakeHealth {
    pub status: Option<u16>,
    pub requests: Mutex<Vec<String>>,
}

impl FakeHealth {
    pub fn answering(status: Option<u16>) -> Self {
        Self {
            status,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HealthChecker for FakeHealth {
    async fn status(&self, url: &Url) -> Option<u16> {
        self.requests.lock().unwrap().push(url.to_string());
        self.status
    }
}

pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        network: NetworkRequest::from_settings("airpods_test", &NetworkSettings::default()),
        restart_policy: RestartPolicy::UnlessStopped,
        gpu_device_flag: Some("--device nvidia.com/gpu=all".to_string()),
        required_dependencies: vec!["podman".to_string(), "uv".to_string()],
        skip_dependency_checks: false,
        max_concurrent_pulls: 1,
        stop_timeout: Duration::from_secs(10),
        ping_timeout: Duration::from_secs(1),
        startup: StartupOptions {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(10),
        },
    }
}

/// The two-service catalog used across scenarios.
pub fn alpha_beta() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::new("alpha", "registry.example.com/alpha:1").with_port(9000, 90),
        ServiceSpec::new("beta", "registry.example.com/beta:1")
            .with_port(9100, 91)
            .with_gpu(true),
    ]
}

pub fn manager_with(
    specs: Vec<ServiceSpec>,
    runtime: Arc<FakeRuntime>,
    system: FakeSystem,
) -> ServiceManager {
    ServiceManager::with_settings(
        Arc::new(ServiceRegistry::new(specs).unwrap()),
        runtime,
        Arc::new(system),
        test_settings(),
    )
}
