//! Service catalog.
//!
//! A [`ServiceRegistry`] is built once from the resolved configuration and never
//! mutated afterwards; a configuration reload builds a new one.

use super::secret::{SecretEnv, SecretFactory, WEBUI_SECRET_ENV, file_secret_factory};
use super::spec::{ServiceSpec, VolumeMount};
use super::{Result, ServiceError};
use crate::config::{AirpodsConfig, ServiceConfig};
use crate::gpu::{self, ComputeCapability};
use crate::state::StatePaths;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Host facts and hooks applied while building the catalog.
#[derive(Clone, Default)]
pub struct CatalogOptions {
    /// Detected GPU compute capability, used for CUDA image selection
    pub gpu_capability: Option<ComputeCapability>,
    /// Select CPU images for `cuda_image` services
    pub force_cpu: bool,
    /// Secret producer for services needing a WebUI secret; defaults to the
    /// state directory's secret file
    pub secret_factory: Option<SecretFactory>,
}

impl std::fmt::Debug for CatalogOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogOptions")
            .field("gpu_capability", &self.gpu_capability)
            .field("force_cpu", &self.force_cpu)
            .field("secret_factory", &self.secret_factory.is_some())
            .finish()
    }
}

/// Ordered, read-only collection of service specs.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    specs: Vec<ServiceSpec>,
}

impl ServiceRegistry {
    /// Build a registry from specs in declared order.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DuplicateService`] when two specs share a name.
    pub fn new(specs: Vec<ServiceSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(ServiceError::DuplicateService(spec.name.clone()));
            }
        }
        Ok(Self { specs })
    }

    /// Build the catalog from enabled services of a resolved configuration.
    pub fn from_config(
        config: &AirpodsConfig,
        state: &StatePaths,
        options: &CatalogOptions,
    ) -> Result<Self> {
        let factory = options
            .secret_factory
            .clone()
            .unwrap_or_else(|| file_secret_factory(state.secret_path()));
        // one shared secret so every service sees the same value
        let secret = Arc::new(SecretEnv::new(WEBUI_SECRET_ENV, factory));

        let specs = config
            .services
            .iter()
            .filter(|(name, service)| {
                if !service.enabled {
                    debug!("Skipping disabled service: {}", name);
                }
                service.enabled
            })
            .map(|(name, service)| build_spec(name, service, state, options, &secret))
            .collect::<Result<Vec<_>>>()?;

        Self::new(specs)
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn all(&self) -> &[ServiceSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Resolve service names to specs.
    ///
    /// `None` or an empty list yields every spec in declared order; otherwise
    /// specs follow the requested order with repeats dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownService`] listing every unknown name
    /// together with all valid names.
    pub fn resolve<S: AsRef<str>>(&self, names: Option<&[S]>) -> Result<Vec<ServiceSpec>> {
        let requested = match names {
            Some(names) if !names.is_empty() => names,
            _ => return Ok(self.specs.clone()),
        };

        let unknown: Vec<String> = requested
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| self.get(name).is_none())
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            return Err(ServiceError::UnknownService {
                unknown,
                available: self.names().into_iter().map(str::to_string).collect(),
            });
        }

        let mut seen = HashSet::new();
        Ok(requested
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| seen.insert(*name))
            .filter_map(|name| self.get(name).cloned())
            .collect())
    }
}

fn build_spec(
    name: &str,
    service: &ServiceConfig,
    state: &StatePaths,
    options: &CatalogOptions,
    secret: &Arc<SecretEnv>,
) -> Result<ServiceSpec> {
    let image = if service.gpu.cuda_image {
        let version = gpu::select_version(options.gpu_capability);
        let image = gpu::image_for(Some(version), options.force_cpu || service.gpu.force_cpu);
        debug!("Selected image {} for {}", image, name);
        image.to_string()
    } else {
        service.image.clone()
    };

    let volumes = service
        .volumes
        .iter()
        .map(|(_, volume)| -> Result<VolumeMount> {
            Ok(VolumeMount::new(
                state.resolve_volume_source(&volume.source)?,
                &volume.target,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ServiceSpec {
        name: name.to_string(),
        pod: service.pod_name(name),
        container: service.container_name(name),
        image,
        ports: service
            .ports
            .iter()
            .map(|port| (port.host, port.container))
            .collect(),
        env: service.env.clone(),
        secret: service.needs_webui_secret.then(|| secret.clone()),
        volumes,
        network_aliases: service.network_aliases.clone(),
        needs_gpu: service.gpu.enabled,
        force_cpu: service.gpu.force_cpu,
        health_path: service.health.path.clone(),
        health_expected: service.health.expected_status,
        memory: service.resources.memory.clone(),
        cpus: service.resources.cpus.clone(),
    })
}
