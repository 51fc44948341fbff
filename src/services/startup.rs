//! Startup health wait.
//!
//! After services are started the caller polls them through a small state
//! machine until each is healthy, has failed, or the time budget runs out:
//!
//! ```text
//! Pending ──► Starting ──► Healthy
//!    │           │
//!    ├───────────┴──► Failed(reason)
//!    └───────────────► TimedOut   (deadline reached while not terminal)
//! ```
//!
//! There is no push notification from the engine; every round re-reads the pod
//! listing and, for running pods with a health path, issues one HTTP health check.

use super::Result;
use super::manager::ServiceManager;
use super::spec::ServiceSpec;
use crate::config::CliConfig;
use crate::runtime::{PodStatusRow, PortBinding};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Startup state of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupState {
    Pending,
    Starting,
    Healthy,
    Failed(String),
    /// Deadline reached; the service may still become healthy later
    TimedOut,
}

impl StartupState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StartupState::Healthy | StartupState::Failed(_) | StartupState::TimedOut
        )
    }
}

impl std::fmt::Display for StartupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupState::Pending => write!(f, "pending"),
            StartupState::Starting => write!(f, "starting"),
            StartupState::Healthy => write!(f, "healthy"),
            StartupState::Failed(reason) => write!(f, "failed: {}", reason),
            StartupState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Poll timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(2),
        }
    }
}

impl StartupOptions {
    pub fn from_cli(cli: &CliConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cli.startup_timeout),
            interval: Duration::from_secs_f64(cli.startup_check_interval),
        }
    }
}

/// HTTP reachability check.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Status code of a GET on `url`, `None` when unreachable.
    async fn status(&self, url: &Url) -> Option<u16>;
}

/// [`HealthChecker`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn status(&self, url: &Url) -> Option<u16> {
        match self.client.get(url.clone()).send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                debug!("Health check {} failed: {}", url, e);
                None
            }
        }
    }
}

/// Health URL for a host port and path on the loopback interface.
pub fn health_url(port: u16, path: &str) -> std::result::Result<Url, url::ParseError> {
    Url::parse(&format!("http://127.0.0.1:{}", port))?.join(path)
}

/// Host port to health-check: the binding for the first declared container port,
/// then any published binding, then the first declared host port.
pub fn health_port(spec: &ServiceSpec, bindings: &[PortBinding]) -> Option<u16> {
    let declared = spec.ports.first().map(|(_, container)| *container);
    bindings
        .iter()
        .find(|binding| Some(binding.container_port) == declared && binding.host_port.is_some())
        .or_else(|| bindings.iter().find(|binding| binding.host_port.is_some()))
        .and_then(|binding| binding.host_port)
        .or_else(|| spec.primary_host_port())
}

async fn evaluate(
    manager: &ServiceManager,
    spec: &ServiceSpec,
    row: Option<&PodStatusRow>,
    checker: &dyn HealthChecker,
) -> Result<StartupState> {
    let Some(row) = row else {
        return Ok(StartupState::Failed(format!("pod {} not found", spec.pod)));
    };

    if row.state.is_terminal() {
        return Ok(StartupState::Failed(format!(
            "pod {} is {}",
            spec.pod, row.state
        )));
    }
    if !row.state.is_running() {
        return Ok(StartupState::Starting);
    }

    let Some(path) = &spec.health_path else {
        return Ok(StartupState::Healthy);
    };
    let bindings = manager.service_ports(spec).await?;
    let Some(port) = health_port(spec, &bindings) else {
        // nothing published to check
        return Ok(StartupState::Healthy);
    };
    let url = match health_url(port, path) {
        Ok(url) => url,
        Err(e) => {
            return Ok(StartupState::Failed(format!(
                "invalid health path {}: {}",
                path, e
            )));
        }
    };

    let (low, high) = spec.health_expected;
    Ok(match checker.status(&url).await {
        Some(code) if (low..=high).contains(&code) => StartupState::Healthy,
        Some(code) => {
            debug!("{} answered {} (expected {}-{})", url, code, low, high);
            StartupState::Starting
        }
        None => StartupState::Starting,
    })
}

/// Poll `specs` until every one is terminal or `options.timeout` elapses.
///
/// `on_change` is invoked on every state transition. Returns the final state
/// per service name in spec order.
pub async fn wait_for_startup(
    manager: &ServiceManager,
    specs: &[ServiceSpec],
    checker: &dyn HealthChecker,
    options: &StartupOptions,
    on_change: Option<&(dyn Fn(&ServiceSpec, &StartupState) + Send + Sync)>,
) -> Result<Vec<(String, StartupState)>> {
    let deadline = Instant::now() + options.timeout;
    let mut states = vec![StartupState::Pending; specs.len()];

    loop {
        let rows = manager.pod_status_rows().await?;
        for (spec, state) in specs.iter().zip(states.iter_mut()) {
            if state.is_terminal() {
                continue;
            }
            let next = evaluate(manager, spec, rows.get(&spec.pod), checker).await?;
            if next != *state {
                debug!("{}: {} -> {}", spec.name, state, next);
                if let Some(on_change) = on_change {
                    on_change(spec, &next);
                }
                *state = next;
            }
        }

        if states.iter().all(StartupState::is_terminal) {
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            for (spec, state) in specs.iter().zip(states.iter_mut()) {
                if !state.is_terminal() {
                    warn!(
                        "{} did not become healthy within {:?}",
                        spec.name, options.timeout
                    );
                    if let Some(on_change) = on_change {
                        on_change(spec, &StartupState::TimedOut);
                    }
                    *state = StartupState::TimedOut;
                }
            }
            break;
        }

        tokio::time::sleep(options.interval.min(deadline - now)).await;
    }

    let healthy = states
        .iter()
        .filter(|state| **state == StartupState::Healthy)
        .count();
    info!("{}/{} service(s) healthy", healthy, specs.len());

    Ok(specs
        .iter()
        .map(|spec| spec.name.clone())
        .zip(states)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url() {
        assert_eq!(
            health_url(11434, "/api/tags").unwrap().as_str(),
            "http://127.0.0.1:11434/api/tags"
        );
        assert_eq!(
            health_url(3000, "/").unwrap().as_str(),
            "http://127.0.0.1:3000/"
        );
    }

    #[test]
    fn test_health_port_prefers_declared_binding() {
        let spec = ServiceSpec::new("open-webui", "ghcr.io/open-webui/open-webui:main")
            .with_port(3000, 8080);
        let binding = |container_port, host_port| PortBinding {
            container_port,
            protocol: "tcp".to_string(),
            host_ip: "0.0.0.0".to_string(),
            host_port,
        };

        assert_eq!(
            health_port(&spec, &[binding(9090, Some(9999)), binding(8080, Some(3001))]),
            Some(3001)
        );
        assert_eq!(health_port(&spec, &[binding(9090, Some(9999))]), Some(9999));
        assert_eq!(health_port(&spec, &[]), Some(3000));
        assert_eq!(
            health_port(&ServiceSpec::new("x", "example.com/x:1"), &[]),
            None
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!StartupState::Pending.is_terminal());
        assert!(!StartupState::Starting.is_terminal());
        assert!(StartupState::Healthy.is_terminal());
        assert!(StartupState::Failed("x".to_string()).is_terminal());
        assert!(StartupState::TimedOut.is_terminal());
        assert_eq!(StartupState::TimedOut.to_string(), "timed out");
    }

    #[test]
    fn test_options_from_cli() {
        let config = crate::config::builtin().unwrap();
        let options = StartupOptions::from_cli(&config.cli);
        assert_eq!(options, StartupOptions::default());
    }
}
