//! The orchestration engine.
//!
//! [`ServiceManager`] composes a [`ServiceRegistry`], a [`ContainerRuntime`] and
//! a [`SystemInspector`]. Provisioning calls are idempotent and fail fast; image
//! pulls fan out to a bounded number of concurrent workers.

use super::registry::ServiceRegistry;
use super::spec::{
    MountKind, PullOutcome, PullPhase, PullReport, ServiceSpec, ServiceStartResult,
    VolumeEnsureResult, VolumeMount,
};
use super::startup::StartupOptions;
use super::{Result, ServiceError};
use crate::config::{AirpodsConfig, RestartPolicy};
use crate::runtime::{
    ContainerRequest, ContainerRuntime, LogOptions, NetworkRequest, PodRequest, PodStatusRow,
    PortBinding, RuntimeError,
};
use crate::state;
use crate::system::{CheckResult, GpuDetection, SystemInspector};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Progress hook for image pulls: `(phase, index, total, spec)` with a 1-based
/// index. Informational only.
///
/// Every image gets exactly one `End`, whether its pull completed, failed or
/// was cancelled before starting.
pub type ProgressCallback<'a> = dyn Fn(PullPhase, usize, usize, &ServiceSpec) + Send + Sync + 'a;

/// Engine settings taken from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub network: NetworkRequest,
    pub restart_policy: RestartPolicy,
    pub gpu_device_flag: Option<String>,
    pub required_dependencies: Vec<String>,
    pub skip_dependency_checks: bool,
    pub max_concurrent_pulls: usize,
    pub stop_timeout: Duration,
    pub ping_timeout: Duration,
    pub startup: StartupOptions,
}

impl ManagerSettings {
    pub fn from_config(config: &AirpodsConfig) -> Self {
        let flag = config.runtime.gpu_device_flag.trim();
        Self {
            network: NetworkRequest::from_settings(
                &config.runtime.network_name,
                &config.runtime.network,
            ),
            restart_policy: config.runtime.restart_policy,
            gpu_device_flag: (!flag.is_empty()).then(|| flag.to_string()),
            required_dependencies: config.dependencies.required.clone(),
            skip_dependency_checks: config.dependencies.skip_checks,
            max_concurrent_pulls: config.cli.max_concurrent_pulls.max(1),
            stop_timeout: Duration::from_secs(config.cli.stop_timeout),
            ping_timeout: Duration::from_secs_f64(config.cli.ping_timeout),
            startup: StartupOptions::from_cli(&config.cli),
        }
    }
}

/// Dependency checks plus GPU detection.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentReport {
    pub checks: Vec<CheckResult>,
    pub gpu: GpuDetection,
}

impl EnvironmentReport {
    /// Names of failed dependency checks.
    pub fn missing(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|check| !check.ok)
            .map(|check| check.name.as_str())
            .collect()
    }

    pub fn gpu_available(&self) -> bool {
        self.gpu.available
    }
}

/// Whether a GPU is attached when starting `spec`.
pub fn gpu_attached(spec: &ServiceSpec, gpu_available: bool, force_cpu_override: bool) -> bool {
    spec.needs_gpu && gpu_available && !force_cpu_override && !spec.force_cpu
}

pub struct ServiceManager {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    system: Arc<dyn SystemInspector>,
    settings: ManagerSettings,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        system: Arc<dyn SystemInspector>,
        config: &AirpodsConfig,
    ) -> Self {
        Self::with_settings(registry, runtime, system, ManagerSettings::from_config(config))
    }

    pub fn with_settings(
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        system: Arc<dyn SystemInspector>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            runtime,
            system,
            settings,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn system(&self) -> &Arc<dyn SystemInspector> {
        &self.system
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Check required dependencies and look for a GPU.
    ///
    /// Missing dependencies are reported, never raised.
    pub async fn report_environment(&self) -> EnvironmentReport {
        let checks = if self.settings.skip_dependency_checks {
            self.settings
                .required_dependencies
                .iter()
                .map(|dep| CheckResult::ok(dep, "skipped"))
                .collect()
        } else {
            futures::future::join_all(
                self.settings
                    .required_dependencies
                    .iter()
                    .map(|dep| self.system.check_dependency(dep)),
            )
            .await
        };

        let gpu = self.system.detect_gpu().await;
        debug!(
            "Environment: {} checks, gpu available = {}",
            checks.len(),
            gpu.available
        );
        EnvironmentReport { checks, gpu }
    }

    /// Fail when the engine binary is missing from the host.
    pub async fn ensure_runtime_available(&self) -> Result<()> {
        if self.settings.skip_dependency_checks {
            return Ok(());
        }

        let name = self.runtime.name();
        let report = self.report_environment().await;
        if report.missing().contains(&name) {
            return Err(RuntimeError::new(
                "check runtime",
                format!("{} is required; install it and retry.", name),
            )
            .into());
        }
        Ok(())
    }

    /// Create the shared network unless it exists.
    ///
    /// An existing network is left as-is even when its parameters differ.
    pub async fn ensure_network(&self) -> Result<bool> {
        let created = self.runtime.ensure_network(&self.settings.network).await?;
        if created {
            info!("Created network: {}", self.settings.network.name);
        }
        Ok(created)
    }

    /// Provision every unique mount across `specs`.
    ///
    /// Mounts are deduplicated by `(kind, source)`. Results list bind mounts
    /// first, then named volumes, each in first-seen order.
    pub async fn ensure_volumes(&self, specs: &[ServiceSpec]) -> Result<Vec<VolumeEnsureResult>> {
        let mut seen = HashSet::new();
        let mut binds: Vec<&VolumeMount> = Vec::new();
        let mut volumes: Vec<&VolumeMount> = Vec::new();
        for mount in specs.iter().flat_map(|spec| spec.volumes.iter()) {
            let kind = mount.kind();
            if !seen.insert((kind, mount.source.as_str())) {
                continue;
            }
            match kind {
                MountKind::Bind => binds.push(mount),
                MountKind::Volume => volumes.push(mount),
            }
        }

        let mut results = Vec::with_capacity(binds.len() + volumes.len());
        for mount in binds {
            let created = state::ensure_bind_source(Path::new(&mount.source))?;
            results.push(VolumeEnsureResult {
                source: mount.source.clone(),
                target: mount.target.clone(),
                kind: MountKind::Bind,
                created,
            });
        }
        for mount in volumes {
            let created = self.runtime.ensure_volume(&mount.source).await?;
            if created {
                info!("Created volume: {}", mount.source);
            }
            results.push(VolumeEnsureResult {
                source: mount.source.clone(),
                target: mount.target.clone(),
                kind: MountKind::Volume,
                created,
            });
        }
        Ok(results)
    }

    /// Pull the image of every spec with up to `max_concurrent` pulls in flight.
    ///
    /// After the first failure no further pull is started; pulls already in
    /// flight finish on their own. The first failure is returned together with
    /// the per-image report.
    pub async fn pull_images(
        &self,
        specs: &[ServiceSpec],
        progress: Option<&ProgressCallback<'_>>,
        max_concurrent: usize,
    ) -> Result<PullReport> {
        let total = specs.len();
        if total == 0 {
            return Ok(PullReport::default());
        }

        let workers = max_concurrent.max(1);
        let cancel_flag = AtomicBool::new(false);
        let cancelled = &cancel_flag;
        debug!("Pulling {} image(s) with {} worker(s)", total, workers);

        let finished: Vec<(usize, PullOutcome)> = stream::iter(specs.iter().enumerate())
            .map(move |(index, spec)| async move {
                let outcome = if cancelled.load(Ordering::SeqCst) {
                    PullOutcome::Cancelled
                } else {
                    if let Some(progress) = progress {
                        progress(PullPhase::Start, index + 1, total, spec);
                    }
                    match self.runtime.pull_image(&spec.image).await {
                        Ok(()) => PullOutcome::Completed,
                        Err(e) => {
                            cancelled.store(true, Ordering::SeqCst);
                            warn!("Failed to pull {}: {}", spec.image, e);
                            PullOutcome::Failed(e)
                        }
                    }
                };
                if let Some(progress) = progress {
                    progress(PullPhase::End, index + 1, total, spec);
                }
                (index, outcome)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        // first failure in completion order
        let first_failure = finished.iter().find_map(|(index, outcome)| match outcome {
            PullOutcome::Failed(e) => Some((*index, e.clone())),
            _ => None,
        });

        let mut ordered = finished;
        ordered.sort_by_key(|(index, _)| *index);
        let report = PullReport {
            entries: ordered
                .into_iter()
                .map(|(index, outcome)| (specs[index].image.clone(), outcome))
                .collect(),
        };

        match first_failure {
            Some((index, source)) => Err(ServiceError::PullFailed {
                image: specs[index].image.clone(),
                source,
                report,
            }),
            None => Ok(report),
        }
    }

    /// Image size per service name; `None` when the image is not present.
    pub async fn image_sizes(&self, specs: &[ServiceSpec]) -> Result<BTreeMap<String, Option<u64>>> {
        let mut sizes = BTreeMap::new();
        for spec in specs {
            sizes.insert(spec.name.clone(), self.runtime.image_size(&spec.image).await?);
        }
        Ok(sizes)
    }

    /// Ensure the pod, then run or replace the container.
    pub async fn start_service(
        &self,
        spec: &ServiceSpec,
        gpu_available: bool,
        force_cpu_override: bool,
    ) -> Result<ServiceStartResult> {
        let pod_created = self
            .runtime
            .ensure_pod(&PodRequest {
                name: spec.pod.clone(),
                ports: spec.ports.clone(),
                network: self.settings.network.name.clone(),
                network_aliases: spec.network_aliases.clone(),
            })
            .await?;

        let gpu = gpu_attached(spec, gpu_available, force_cpu_override);
        let request = ContainerRequest {
            pod: spec.pod.clone(),
            name: spec.container.clone(),
            image: spec.image.clone(),
            env: spec.runtime_env()?,
            volumes: spec
                .volumes
                .iter()
                .map(|mount| (mount.source.clone(), mount.target.clone()))
                .collect(),
            network_aliases: spec.network_aliases.clone(),
            gpu,
            gpu_device_flag: self.settings.gpu_device_flag.clone(),
            restart_policy: self.settings.restart_policy,
            memory: spec.memory.clone(),
            cpus: spec.cpus.clone(),
        };
        let container_replaced = self.runtime.run_container(&request).await?;

        info!(
            "Started {} (pod created: {}, container replaced: {}, gpu: {})",
            spec.name, pod_created, container_replaced, gpu
        );
        Ok(ServiceStartResult {
            spec: spec.clone(),
            pod_created,
            container_replaced,
        })
    }

    /// Stop a service's pod, optionally removing it.
    ///
    /// Returns `false` without touching the engine when the pod does not exist.
    /// Volumes are never removed.
    pub async fn stop_service(
        &self,
        spec: &ServiceSpec,
        remove: bool,
        timeout: Duration,
    ) -> Result<bool> {
        if !self.runtime.pod_exists(&spec.pod).await? {
            debug!("Pod {} does not exist, nothing to stop", spec.pod);
            return Ok(false);
        }

        self.runtime.stop_pod(&spec.pod, timeout).await?;
        if remove {
            self.runtime.remove_pod(&spec.pod).await?;
        }
        info!("Stopped {} (removed: {})", spec.name, remove);
        Ok(true)
    }

    pub async fn container_exists(&self, spec: &ServiceSpec) -> Result<bool> {
        Ok(self.runtime.container_exists(&spec.container).await?)
    }

    /// Published ports of the service's pod; empty when the pod is absent.
    pub async fn service_ports(&self, spec: &ServiceSpec) -> Result<Vec<PortBinding>> {
        Ok(self
            .runtime
            .pod_inspect(&spec.pod)
            .await?
            .map(|inspect| inspect.port_bindings)
            .unwrap_or_default())
    }

    /// Current pods keyed by pod name.
    pub async fn pod_status_rows(&self) -> Result<BTreeMap<String, PodStatusRow>> {
        Ok(self
            .runtime
            .pod_status()
            .await?
            .into_iter()
            .map(|row| (row.name.clone(), row))
            .collect())
    }

    pub async fn stream_logs(&self, spec: &ServiceSpec, options: &LogOptions) -> Result<i32> {
        Ok(self.runtime.stream_logs(&spec.container, options).await?)
    }

    pub async fn remove_network(&self) -> Result<()> {
        self.runtime.remove_network(&self.settings.network.name).await?;
        info!("Removed network: {}", self.settings.network.name);
        Ok(())
    }

    pub async fn remove_image(&self, spec: &ServiceSpec) -> Result<()> {
        Ok(self.runtime.remove_image(&spec.image).await?)
    }

    pub async fn list_volumes(&self) -> Result<Vec<String>> {
        Ok(self.runtime.list_volumes().await?)
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        Ok(self.runtime.remove_volume(name).await?)
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.registry.names())
            .field("runtime", &self.runtime.name())
            .field("settings", &self.settings)
            .finish()
    }
}
