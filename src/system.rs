//! Host dependency checks and GPU detection.
//!
//! Every check fails softly: a missing tool or a broken `nvidia-smi` becomes a
//! negative result carrying a reason, never an error. The [`SystemInspector`] trait
//! lets the orchestration engine run against scripted answers in tests.

use crate::gpu::ComputeCapability;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use which::which;

/// Outcome of checking one external dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn missing(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Result of probing for an NVIDIA GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDetection {
    /// GPU present and its capability parsed
    pub available: bool,
    /// GPU name, or the reason detection failed
    pub detail: String,
    pub capability: Option<ComputeCapability>,
}

impl GpuDetection {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            detail: reason.into(),
            capability: None,
        }
    }
}

/// Injectable host inspector.
#[async_trait]
pub trait SystemInspector: Send + Sync {
    /// Check that `name` is on `PATH` and answers `--version`.
    async fn check_dependency(&self, name: &str) -> CheckResult;

    /// Best-effort GPU detection.
    async fn detect_gpu(&self) -> GpuDetection;
}

/// Inspector backed by the real host (`PATH` lookup and `nvidia-smi`).
#[derive(Debug, Clone, Copy, Default)]
pub struct HostInspector;

#[async_trait]
impl SystemInspector for HostInspector {
    async fn check_dependency(&self, name: &str) -> CheckResult {
        check_dependency(name).await
    }

    async fn detect_gpu(&self) -> GpuDetection {
        detect_gpu().await
    }
}

/// Run a command, returning its trimmed combined output on success.
async fn run_command(program: &str, args: &[&str]) -> Result<String, String> {
    debug!("Probing host: {} {:?}", program, args);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() { stdout } else { stderr })
    }
}

/// Check a dependency on the real host.
pub async fn check_dependency(name: &str) -> CheckResult {
    if which(name).is_err() {
        return CheckResult::missing(name, "not found in PATH");
    }

    match run_command(name, &["--version"]).await {
        Ok(output) => {
            let first_line = output.lines().next().unwrap_or("available").to_string();
            CheckResult::ok(name, first_line)
        }
        Err(_) => CheckResult::missing(name, "unable to run"),
    }
}

/// Detect an NVIDIA GPU and its compute capability via `nvidia-smi`.
pub async fn detect_gpu() -> GpuDetection {
    if which("nvidia-smi").is_err() {
        return GpuDetection::unavailable("nvidia-smi not found");
    }

    match run_command(
        "nvidia-smi",
        &[
            "--query-gpu=name,compute_cap",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
    {
        Ok(output) => parse_nvidia_smi(&output),
        Err(_) => GpuDetection::unavailable("nvidia-smi failed"),
    }
}

/// Parse `nvidia-smi --query-gpu=name,compute_cap` output.
///
/// Only the first GPU line is considered, e.g. `NVIDIA GeForce GTX 1650, 7.5`.
pub fn parse_nvidia_smi(output: &str) -> GpuDetection {
    let Some(line) = output.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return GpuDetection::unavailable("no GPUs detected");
    };

    let Some((name, capability)) = line.split_once(',') else {
        return GpuDetection::unavailable(format!(
            "{} (compute capability parse failed)",
            line
        ));
    };

    let name = name.trim();
    match parse_capability(capability.trim()) {
        Some(cap) => GpuDetection {
            available: true,
            detail: name.to_string(),
            capability: Some(cap),
        },
        None => GpuDetection::unavailable(format!(
            "{} (compute capability parse failed: {:?})",
            name,
            capability.trim()
        )),
    }
}

fn parse_capability(text: &str) -> Option<ComputeCapability> {
    let (major, minor) = text.split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}
