//! Service catalog and orchestration engine.
//!
//! - [`registry`]: immutable [`ServiceRegistry`] built from resolved configuration
//! - [`manager`]: the [`ServiceManager`] driving a [`ContainerRuntime`]
//! - [`startup`]: the post-start health wait
//! - [`handle`]: [`ManagerHandle`] for configuration reloads
//!
//! [`ContainerRuntime`]: crate::runtime::ContainerRuntime

pub mod handle;
pub mod manager;
pub mod registry;
pub mod secret;
pub mod spec;
pub mod startup;

use crate::config::ConfigError;
use crate::runtime::RuntimeError;

pub use handle::ManagerHandle;
pub use manager::{
    EnvironmentReport, ManagerSettings, ProgressCallback, ServiceManager, gpu_attached,
};
pub use registry::{CatalogOptions, ServiceRegistry};
pub use secret::{SecretEnv, SecretFactory, file_secret_factory};
pub use spec::{
    MountKind, PullOutcome, PullPhase, PullReport, ServiceSpec, ServiceStartResult,
    VolumeEnsureResult, VolumeMount,
};
pub use startup::{HealthChecker, HttpHealthChecker, StartupOptions, StartupState, wait_for_startup};

/// Orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// One or more requested names are not in the registry
    #[error(
        "Unknown service(s): {}. Available: {}",
        .unknown.join(", "),
        .available.join(", ")
    )]
    UnknownService {
        unknown: Vec<String>,
        available: Vec<String>,
    },

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A pull batch failed; `report` holds every image's outcome
    #[error("Failed to pull {image}: {source}")]
    PullFailed {
        image: String,
        source: RuntimeError,
        report: PullReport,
    },

    #[error("Secret generation failed: {0}")]
    Secret(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
