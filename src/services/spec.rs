//! Service definitions and orchestration outcome values.

use super::Result;
use super::secret::SecretEnv;
use crate::runtime::RuntimeError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// How a volume source is provided to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountKind {
    /// Host directory mounted into the container
    Bind,
    /// Engine-managed named volume
    Volume,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountKind::Bind => "bind",
            MountKind::Volume => "volume",
        }
    }
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(source, target)` mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

impl VolumeMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// An absolute source is a bind mount, anything else a named volume.
    pub fn kind(&self) -> MountKind {
        if Path::new(&self.source).is_absolute() {
            MountKind::Bind
        } else {
            MountKind::Volume
        }
    }
}

/// Immutable definition of one service.
///
/// Pod and container names are derived from the service name unless the
/// configuration overrides them.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub pod: String,
    pub container: String,
    pub image: String,
    /// `(host, container)` port pairs in declared order
    pub ports: Vec<(u16, u16)>,
    pub env: BTreeMap<String, String>,
    /// Environment entry computed at start time
    pub secret: Option<Arc<SecretEnv>>,
    pub volumes: Vec<VolumeMount>,
    pub network_aliases: Vec<String>,
    pub needs_gpu: bool,
    pub force_cpu: bool,
    pub health_path: Option<String>,
    /// Inclusive range of acceptable health-check status codes
    pub health_expected: (u16, u16),
    pub memory: Option<String>,
    pub cpus: Option<String>,
}

impl ServiceSpec {
    /// Create a spec with derived pod (`<name>`) and container (`<name>-0`) names.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            pod: name.clone(),
            container: format!("{}-0", name),
            name,
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            secret: None,
            volumes: Vec::new(),
            network_aliases: Vec::new(),
            needs_gpu: false,
            force_cpu: false,
            health_path: None,
            health_expected: (200, 299),
            memory: None,
            cpus: None,
        }
    }

    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push((host, container));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount::new(source, target));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.network_aliases.push(alias.into());
        self
    }

    pub fn with_gpu(mut self, needs_gpu: bool) -> Self {
        self.needs_gpu = needs_gpu;
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    pub fn with_secret(mut self, secret: Arc<SecretEnv>) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Static environment merged with the runtime-computed secret, if any.
    ///
    /// # Errors
    ///
    /// Fails when the secret factory fails.
    pub fn runtime_env(&self) -> Result<BTreeMap<String, String>> {
        let mut env = self.env.clone();
        if let Some(secret) = &self.secret {
            env.insert(secret.key().to_string(), secret.value()?);
        }
        Ok(env)
    }

    /// First declared host port.
    pub fn primary_host_port(&self) -> Option<u16> {
        self.ports.first().map(|(host, _)| *host)
    }
}

/// Outcome of provisioning one unique mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEnsureResult {
    pub source: String,
    pub target: String,
    pub kind: MountKind,
    pub created: bool,
}

/// Outcome of starting one service.
#[derive(Debug, Clone)]
pub struct ServiceStartResult {
    pub spec: ServiceSpec,
    pub pod_created: bool,
    pub container_replaced: bool,
}

/// Progress phase reported by [`pull_images`](super::ServiceManager::pull_images).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPhase {
    Start,
    End,
}

/// Final state of one image pull within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Completed,
    Failed(RuntimeError),
    /// Never started because an earlier pull failed
    Cancelled,
}

/// Per-image outcomes of a pull batch, in spec order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub entries: Vec<(String, PullOutcome)>,
}

impl PullReport {
    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, outcome)| *outcome == PullOutcome::Completed)
            .map(|(image, _)| image.as_str())
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, outcome)| *outcome == PullOutcome::Cancelled)
            .map(|(image, _)| image.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, outcome)| *outcome == PullOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::secret::SecretFactory;

    #[test]
    fn test_derived_names() {
        let spec = ServiceSpec::new("ollama", "docker.io/ollama/ollama:latest");
        assert_eq!(spec.pod, "ollama");
        assert_eq!(spec.container, "ollama-0");
        assert_eq!(spec.health_expected, (200, 299));
    }

    #[test]
    fn test_mount_kind_is_structural() {
        assert_eq!(VolumeMount::new("/srv/data", "/data").kind(), MountKind::Bind);
        assert_eq!(
            VolumeMount::new("ollama_models", "/root/.ollama").kind(),
            MountKind::Volume
        );
        assert_eq!(MountKind::Bind.to_string(), "bind");
    }

    #[test]
    fn test_runtime_env_merges_secret() {
        let factory: SecretFactory = Arc::new(|| Ok("s3cret".to_string()));
        let spec = ServiceSpec::new("open-webui", "ghcr.io/open-webui/open-webui:main")
            .with_env("PORT", "8080")
            .with_secret(Arc::new(SecretEnv::new("WEBUI_SECRET_KEY", factory)));

        let env = spec.runtime_env().unwrap();
        assert_eq!(env["PORT"], "8080");
        assert_eq!(env["WEBUI_SECRET_KEY"], "s3cret");
        assert!(!spec.env.contains_key("WEBUI_SECRET_KEY"));
    }

    #[test]
    fn test_pull_report_queries() {
        let report = PullReport {
            entries: vec![
                ("a".to_string(), PullOutcome::Completed),
                (
                    "b".to_string(),
                    PullOutcome::Failed(RuntimeError::new("pull image b", "denied")),
                ),
                ("c".to_string(), PullOutcome::Cancelled),
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.completed().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(report.cancelled().collect::<Vec<_>>(), vec!["c"]);
    }
}
