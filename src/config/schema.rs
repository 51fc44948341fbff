//! Typed configuration and schema validation.
//!
//! [`validate`] turns a merged document into an [`AirpodsConfig`], rejecting
//! anything mistyped or out of range with the dotted path of the offending
//! field (`cli.stop_timeout`, `services.ollama.ports[0].host`). Nothing is
//! auto-corrected.

use super::{ConfigError, Result};
use crate::state;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use toml::{Table, Value};

/// Services every configuration must define.
pub const REQUIRED_SERVICES: &[&str] = &["ollama", "open-webui"];

static MEMORY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[kKmMgG]$").expect("memory pattern is valid"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaConfig {
    pub version: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
        }
    }
}

/// Which container engine to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePreference {
    #[default]
    Auto,
    Podman,
    Docker,
}

impl RuntimePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimePreference::Auto => "auto",
            RuntimePreference::Podman => "podman",
            RuntimePreference::Docker => "docker",
        }
    }
}

/// Container restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    OnFailure,
    Always,
    #[default]
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

/// Shared network topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSettings {
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
    pub ipv6: bool,
    pub internal: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            driver: "bridge".to_string(),
            subnet: None,
            gateway: None,
            dns_servers: Vec::new(),
            ipv6: false,
            internal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub prefer: RuntimePreference,
    pub host_gateway: String,
    pub network_name: String,
    pub network: NetworkSettings,
    pub gpu_device_flag: String,
    pub restart_policy: RestartPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prefer: RuntimePreference::Auto,
            host_gateway: "auto".to_string(),
            network_name: "airpods_network".to_string(),
            network: NetworkSettings::default(),
            gpu_device_flag: "auto".to_string(),
            restart_policy: RestartPolicy::UnlessStopped,
        }
    }
}

/// Operator-facing defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CliConfig {
    /// Grace period when stopping pods, in seconds
    pub stop_timeout: u64,
    pub log_lines: u64,
    /// Health check request timeout, in seconds
    pub ping_timeout: f64,
    /// Overall startup wait budget, in seconds
    pub startup_timeout: u64,
    /// Delay between startup polls, in seconds
    pub startup_check_interval: f64,
    pub max_concurrent_pulls: usize,
    pub auto_confirm: bool,
    pub debug: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            stop_timeout: 10,
            log_lines: 200,
            ping_timeout: 2.0,
            startup_timeout: 120,
            startup_check_interval: 2.0,
            max_concurrent_pulls: 1,
            auto_confirm: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependenciesConfig {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub skip_checks: bool,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            required: vec![
                "podman".to_string(),
                "podman-compose".to_string(),
                "uv".to_string(),
            ],
            optional: vec!["nvidia-smi".to_string()],
            skip_checks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeConfig {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuConfig {
    pub enabled: bool,
    pub force_cpu: bool,
    /// Replace the image with the CUDA variant matching the detected GPU
    pub cuda_image: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_cpu: false,
            cuda_image: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub expected_status: (u16, u16),
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: None,
            expected_status: (200, 299),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    /// Memory limit such as `512m` or `4g`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

/// One `[services.<name>]` definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub enabled: bool,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub network_aliases: Vec<String>,
    pub ports: Vec<PortMapping>,
    /// Named mounts in declared order
    #[serde(serialize_with = "serialize_volumes")]
    pub volumes: Vec<(String, VolumeConfig)>,
    pub gpu: GpuConfig,
    pub health: HealthConfig,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    pub needs_webui_secret: bool,
}

impl ServiceConfig {
    /// Pod name, defaulting to the service name.
    pub fn pod_name(&self, service: &str) -> String {
        self.pod.clone().unwrap_or_else(|| service.to_string())
    }

    /// Container name, defaulting to `<service>-0`.
    pub fn container_name(&self, service: &str) -> String {
        self.container
            .clone()
            .unwrap_or_else(|| format!("{}-0", service))
    }
}

fn serialize_volumes<S>(
    volumes: &[(String, VolumeConfig)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(volumes.iter().map(|(key, volume)| (key, volume)))
}

/// The validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AirpodsConfig {
    pub meta: MetaConfig,
    pub runtime: RuntimeConfig,
    pub cli: CliConfig,
    pub dependencies: DependenciesConfig,
    /// Service definitions in declared order
    pub services: Vec<(String, ServiceConfig)>,
}

impl AirpodsConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|(service, _)| service == name)
            .map(|(_, config)| config)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|(name, _)| name.as_str())
    }

    /// Convert back into a document tree.
    pub fn to_document(&self) -> Result<Table> {
        let mut doc = Table::new();
        doc.insert("meta".to_string(), to_value("meta", &self.meta)?);
        doc.insert("runtime".to_string(), to_value("runtime", &self.runtime)?);
        doc.insert("cli".to_string(), to_value("cli", &self.cli)?);
        doc.insert(
            "dependencies".to_string(),
            to_value("dependencies", &self.dependencies)?,
        );

        let mut services = Table::new();
        for (name, service) in &self.services {
            let path = format!("services.{}", name);
            services.insert(name.clone(), to_value(&path, service)?);
        }
        doc.insert("services".to_string(), Value::Table(services));

        Ok(doc)
    }
}

fn to_value<T: Serialize>(path: &str, value: &T) -> Result<Value> {
    Value::try_from(value).map_err(|e| invalid(path, e.to_string()))
}

fn invalid(path: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.into(),
        message: message.into(),
    }
}

fn decode<T: DeserializeOwned>(path: &str, value: &Value) -> Result<T> {
    value
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| invalid(path, e.message()))
}

/// One table of the document together with its dotted path.
struct Fields<'a> {
    path: String,
    entries: &'a Table,
}

impl<'a> Fields<'a> {
    fn new(path: impl Into<String>, value: &'a Value) -> Result<Self> {
        let path = path.into();
        match value {
            Value::Table(entries) => Ok(Self { path, entries }),
            other => Err(invalid(
                path,
                format!("expected a table, found {}", other.type_str()),
            )),
        }
    }

    fn path_of(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.entries
            .get(key)
            .map(|value| decode(&self.path_of(key), value))
            .transpose()
    }

    fn or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| invalid(self.path_of(key), "missing required field"))
    }

    fn table(&self, key: &str) -> Result<Option<Fields<'a>>> {
        self.entries
            .get(key)
            .map(|value| Fields::new(self.path_of(key), value))
            .transpose()
    }

    /// Read the sub-table under `key` over `default`, or keep `default`.
    fn nested<T>(
        &self,
        key: &str,
        default: T,
        read: impl FnOnce(&Fields<'a>, T) -> Result<T>,
    ) -> Result<T> {
        match self.table(key)? {
            Some(fields) => read(&fields, default),
            None => Ok(default),
        }
    }
}

fn read_meta(fields: &Fields<'_>, defaults: MetaConfig) -> Result<MetaConfig> {
    Ok(MetaConfig {
        version: fields.or("version", defaults.version)?,
    })
}

fn read_network(fields: &Fields<'_>, defaults: NetworkSettings) -> Result<NetworkSettings> {
    Ok(NetworkSettings {
        driver: fields.or("driver", defaults.driver)?,
        subnet: fields.get("subnet")?.or(defaults.subnet),
        gateway: fields.get("gateway")?.or(defaults.gateway),
        dns_servers: fields.or("dns_servers", defaults.dns_servers)?,
        ipv6: fields.or("ipv6", defaults.ipv6)?,
        internal: fields.or("internal", defaults.internal)?,
    })
}

fn read_runtime(fields: &Fields<'_>, defaults: RuntimeConfig) -> Result<RuntimeConfig> {
    Ok(RuntimeConfig {
        prefer: fields.or("prefer", defaults.prefer)?,
        host_gateway: fields.or("host_gateway", defaults.host_gateway)?,
        network_name: fields.or("network_name", defaults.network_name)?,
        network: fields.nested("network", defaults.network, read_network)?,
        gpu_device_flag: fields.or("gpu_device_flag", defaults.gpu_device_flag)?,
        restart_policy: fields.or("restart_policy", defaults.restart_policy)?,
    })
}

fn read_cli(fields: &Fields<'_>, defaults: CliConfig) -> Result<CliConfig> {
    Ok(CliConfig {
        stop_timeout: fields.or("stop_timeout", defaults.stop_timeout)?,
        log_lines: fields.or("log_lines", defaults.log_lines)?,
        ping_timeout: fields.or("ping_timeout", defaults.ping_timeout)?,
        startup_timeout: fields.or("startup_timeout", defaults.startup_timeout)?,
        startup_check_interval: fields
            .or("startup_check_interval", defaults.startup_check_interval)?,
        max_concurrent_pulls: fields.or("max_concurrent_pulls", defaults.max_concurrent_pulls)?,
        auto_confirm: fields.or("auto_confirm", defaults.auto_confirm)?,
        debug: fields.or("debug", defaults.debug)?,
    })
}

fn read_dependencies(
    fields: &Fields<'_>,
    defaults: DependenciesConfig,
) -> Result<DependenciesConfig> {
    Ok(DependenciesConfig {
        required: fields.or("required", defaults.required)?,
        optional: fields.or("optional", defaults.optional)?,
        skip_checks: fields.or("skip_checks", defaults.skip_checks)?,
    })
}

fn read_port(fields: Fields<'_>) -> Result<PortMapping> {
    Ok(PortMapping {
        host: fields.required("host")?,
        container: fields.required("container")?,
    })
}

/// `ports` is one `{ host, container }` table or an array of them.
fn read_ports(fields: &Fields<'_>) -> Result<Vec<PortMapping>> {
    let path = fields.path_of("ports");
    match fields.entries.get("ports") {
        None => Ok(Vec::new()),
        Some(value @ Value::Table(_)) => Ok(vec![read_port(Fields::new(path, value)?)?]),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Fields::new(format!("{}[{}]", path, index), item).and_then(read_port)
            })
            .collect(),
        Some(other) => Err(invalid(
            path,
            format!(
                "expected a port table or an array of them, found {}",
                other.type_str()
            ),
        )),
    }
}

fn read_volumes(fields: &Fields<'_>) -> Result<Vec<(String, VolumeConfig)>> {
    let Some(table) = fields.table("volumes")? else {
        return Ok(Vec::new());
    };
    let mut volumes = Vec::with_capacity(table.entries.len());
    for (key, value) in table.entries {
        let volume = Fields::new(table.path_of(key), value)?;
        volumes.push((
            key.clone(),
            VolumeConfig {
                source: volume.required("source")?,
                target: volume.required("target")?,
            },
        ));
    }
    Ok(volumes)
}

fn read_env(fields: &Fields<'_>) -> Result<BTreeMap<String, String>> {
    let Some(table) = fields.table("env")? else {
        return Ok(BTreeMap::new());
    };
    table
        .entries
        .iter()
        .map(|(key, value)| -> Result<(String, String)> {
            Ok((key.clone(), decode(&table.path_of(key), value)?))
        })
        .collect()
}

fn read_gpu(fields: &Fields<'_>, defaults: GpuConfig) -> Result<GpuConfig> {
    Ok(GpuConfig {
        enabled: fields.or("enabled", defaults.enabled)?,
        force_cpu: fields.or("force_cpu", defaults.force_cpu)?,
        cuda_image: fields.or("cuda_image", defaults.cuda_image)?,
    })
}

fn read_health(fields: &Fields<'_>, defaults: HealthConfig) -> Result<HealthConfig> {
    Ok(HealthConfig {
        path: fields.get("path")?.or(defaults.path),
        expected_status: fields.or("expected_status", defaults.expected_status)?,
    })
}

fn read_resources(fields: &Fields<'_>, defaults: ResourceLimits) -> Result<ResourceLimits> {
    Ok(ResourceLimits {
        memory: fields.get("memory")?.or(defaults.memory),
        cpus: fields.get("cpus")?.or(defaults.cpus),
    })
}

fn read_service(fields: &Fields<'_>) -> Result<ServiceConfig> {
    Ok(ServiceConfig {
        enabled: fields.or("enabled", true)?,
        image: fields.required("image")?,
        pod: fields.get("pod")?,
        container: fields.get("container")?,
        network_aliases: fields.or("network_aliases", Vec::new())?,
        ports: read_ports(fields)?,
        volumes: read_volumes(fields)?,
        gpu: fields.nested("gpu", GpuConfig::default(), read_gpu)?,
        health: fields.nested("health", HealthConfig::default(), read_health)?,
        env: read_env(fields)?,
        resources: fields.nested("resources", ResourceLimits::default(), read_resources)?,
        needs_webui_secret: fields.or("needs_webui_secret", false)?,
    })
}

/// Validate a merged document into a typed configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] naming the first offending field path.
pub fn validate(doc: &Table) -> Result<AirpodsConfig> {
    let root = Fields {
        path: String::new(),
        entries: doc,
    };
    let meta = root.nested("meta", MetaConfig::default(), read_meta)?;
    let runtime = root.nested("runtime", RuntimeConfig::default(), read_runtime)?;
    let cli = root.nested("cli", CliConfig::default(), read_cli)?;
    let dependencies = root.nested(
        "dependencies",
        DependenciesConfig::default(),
        read_dependencies,
    )?;

    check_runtime(&runtime)?;
    check_cli(&cli)?;

    let mut services = Vec::new();
    if let Some(table) = root.table("services")? {
        for (name, value) in table.entries {
            let fields = Fields::new(table.path_of(name), value)?;
            let service = read_service(&fields)?;
            check_service(&fields.path, &service)?;
            services.push((name.clone(), service));
        }
    }

    let missing: Vec<&str> = REQUIRED_SERVICES
        .iter()
        .copied()
        .filter(|required| !services.iter().any(|(name, _)| name == required))
        .collect();
    if !missing.is_empty() {
        return Err(invalid(
            "services",
            format!("missing required service definitions: {}", missing.join(", ")),
        ));
    }

    Ok(AirpodsConfig {
        meta,
        runtime,
        cli,
        dependencies,
        services,
    })
}

fn check_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.network_name.trim().is_empty() {
        return Err(invalid("runtime.network_name", "must not be empty"));
    }
    if runtime.network.driver.trim().is_empty() {
        return Err(invalid("runtime.network.driver", "must not be empty"));
    }
    Ok(())
}

fn check_int_range(path: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            path,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

fn check_float_range(path: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(invalid(
            path,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

fn check_cli(cli: &CliConfig) -> Result<()> {
    check_int_range("cli.stop_timeout", cli.stop_timeout, 1, 300)?;
    check_int_range("cli.log_lines", cli.log_lines, 1, 10_000)?;
    check_float_range("cli.ping_timeout", cli.ping_timeout, 0.1, 60.0)?;
    check_int_range("cli.startup_timeout", cli.startup_timeout, 10, 600)?;
    check_float_range(
        "cli.startup_check_interval",
        cli.startup_check_interval,
        0.5,
        10.0,
    )?;
    check_int_range(
        "cli.max_concurrent_pulls",
        cli.max_concurrent_pulls as u64,
        1,
        10,
    )?;
    Ok(())
}

fn check_service(path: &str, service: &ServiceConfig) -> Result<()> {
    let image = service.image.trim();
    if image.is_empty() {
        return Err(invalid(format!("{}.image", path), "image cannot be empty"));
    }
    if !image.contains('/') {
        return Err(invalid(
            format!("{}.image", path),
            "image must include registry/repository (e.g. docker.io/library/image)",
        ));
    }

    for (index, port) in service.ports.iter().enumerate() {
        if port.host == 0 {
            return Err(invalid(
                format!("{}.ports[{}].host", path, index),
                "port must be in 1..=65535",
            ));
        }
        if port.container == 0 {
            return Err(invalid(
                format!("{}.ports[{}].container", path, index),
                "port must be in 1..=65535",
            ));
        }
    }

    for (key, volume) in &service.volumes {
        if volume.source.trim().is_empty() {
            return Err(invalid(
                format!("{}.volumes.{}.source", path, key),
                "source must not be empty",
            ));
        }
        if let Err(e) = state::bind_relative(&volume.source) {
            return Err(invalid(
                format!("{}.volumes.{}.source", path, key),
                e.to_string(),
            ));
        }
        if !volume.target.starts_with('/') {
            return Err(invalid(
                format!("{}.volumes.{}.target", path, key),
                "container mount path must be absolute",
            ));
        }
    }

    let (start, end) = service.health.expected_status;
    if start > end {
        return Err(invalid(
            format!("{}.health.expected_status", path),
            "status range start must be <= end",
        ));
    }
    if !(100..=599).contains(&start) || !(100..=599).contains(&end) {
        return Err(invalid(
            format!("{}.health.expected_status", path),
            "HTTP status codes must be in 100..=599",
        ));
    }

    if let Some(memory) = &service.resources.memory
        && !MEMORY_PATTERN.is_match(memory)
    {
        return Err(invalid(
            format!("{}.resources.memory", path),
            "memory must look like '512m' or '4g'",
        ));
    }

    Ok(())
}
