//! Application configuration.
//!
//! Loaded from defaults, then `$XDG_CONFIG_HOME/labvisor/config.toml`, then
//! `LABVISOR__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use labvisor_protocol::{BackendKind, FlagSpec, PortRole};

pub const APP_NAME: &str = "labvisor";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sessions: SessionsConfig,
    pub readiness: ReadinessConfig,
    pub reconciler: ReconcilerConfig,
    pub ports: PortsConfig,
    pub backend: BackendConfig,
    pub terminal: TerminalConfig,
    pub access: AccessConfig,
    pub presets: BTreeMap<String, PresetConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            sessions: SessionsConfig::default(),
            readiness: ReadinessConfig::default(),
            reconciler: ReconcilerConfig::default(),
            ports: PortsConfig::default(),
            backend: BackendConfig::default(),
            terminal: TerminalConfig::default(),
            access: AccessConfig::default(),
            presets: default_presets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Lifetime of an ephemeral lab session.
    pub lab_timeout_minutes: u32,
    /// Lifetime of a persistent environment between restarts.
    pub persistent_timeout_minutes: u32,
    /// Upper bound for a single explicit extension.
    pub max_extension_minutes: u32,
    /// Maximum concurrently active sessions per user (0 disables the cap).
    pub max_sessions_per_user: usize,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// How long ended sessions stay queryable.
    pub ended_retention_minutes: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            lab_timeout_minutes: 60,
            persistent_timeout_minutes: 240,
            max_extension_minutes: 60,
            max_sessions_per_user: 3,
            start_timeout_secs: 120,
            stop_timeout_secs: 30,
            stop_grace_secs: 10,
            ended_retention_minutes: 60,
        }
    }
}

impl SessionsConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub sweep_orphans: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            shutdown_timeout_secs: 30,
            sweep_orphans: true,
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub ssh: PortRange,
    pub vnc: PortRange,
    pub web: PortRange,
    /// Random probes before falling back to a linear scan.
    pub random_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            ssh: PortRange::new(10000, 10999),
            vnc: PortRange::new(11000, 11999),
            web: PortRange::new(12000, 12999),
            random_attempts: 32,
        }
    }
}

impl PortsConfig {
    pub fn range_for(&self, role: PortRole) -> PortRange {
        match role {
            PortRole::Ssh => self.ssh,
            PortRole::Vnc => self.vnc,
            PortRole::Web => self.web,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Pod when running inside Kubernetes, container otherwise.
    #[default]
    Auto,
    Container,
    Pod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub container: ContainerBackendConfig,
    pub kubernetes: KubernetesConfig,
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeChoice {
    #[default]
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerBackendConfig {
    pub runtime: RuntimeChoice,
    /// Explicit path to the runtime binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// API server base URL. `http://127.0.0.1:8001` targets a `kubectl proxy` sidecar.
    pub api_url: String,
    pub namespace: String,
    /// Bearer token file (the in-cluster service account token by default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
    pub kubectl_binary: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            namespace: "labvisor-labs".to_string(),
            token_path: None,
            kubectl_binary: "kubectl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub qemu_binary: String,
    pub qemu_img_binary: String,
    /// Base qcow2 image every overlay is backed by.
    pub template_path: String,
    /// Directory holding overlays, PID files and VNC sockets.
    pub work_dir: String,
    pub ssh_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    pub enable_kvm: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".to_string(),
            qemu_img_binary: "qemu-img".to_string(),
            template_path: "/var/lib/labvisor/templates/lab.qcow2".to_string(),
            work_dir: "/var/lib/labvisor/vms".to_string(),
            ssh_user: "student".to_string(),
            ssh_key_path: None,
            enable_kvm: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    /// Subprocess PTY when `kubectl` is installed, streaming API otherwise.
    #[default]
    Auto,
    Stream,
    Subprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub transport: TransportChoice,
    pub cols: u16,
    pub rows: u16,
    /// Output chunks buffered before the reader applies backpressure.
    pub output_buffer: usize,
    /// Shells probed in priority order.
    pub shell_candidates: Vec<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            transport: TransportChoice::Auto,
            cols: 120,
            rows: 40,
            output_buffer: 64,
            shell_candidates: vec![
                "/bin/bash".to_string(),
                "/bin/zsh".to_string(),
                "/bin/ash".to_string(),
                "/bin/sh".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Hostname clients use to reach published ports.
    pub public_host: String,
    pub username: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            username: "student".to_string(),
        }
    }
}

/// Named configuration bundle describing what a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub memory_mb: u32,
    pub cpus: f32,
    #[serde(default)]
    pub ports: Vec<PortRole>,
    /// Pin the preset to a backend (only `vm` is meaningful today).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub desktop: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<FlagSpec>,
}

fn default_presets() -> BTreeMap<String, PresetConfig> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "minimal".to_string(),
        PresetConfig {
            image: "labvisor/minimal:latest".to_string(),
            command: Vec::new(),
            memory_mb: 512,
            cpus: 0.5,
            ports: vec![PortRole::Ssh],
            backend: None,
            desktop: false,
            flags: Vec::new(),
        },
    );
    presets.insert(
        "pentest".to_string(),
        PresetConfig {
            image: "labvisor/pentest:latest".to_string(),
            command: Vec::new(),
            memory_mb: 2048,
            cpus: 2.0,
            ports: vec![PortRole::Ssh],
            backend: None,
            desktop: false,
            flags: Vec::new(),
        },
    );
    presets.insert(
        "desktop".to_string(),
        PresetConfig {
            image: "labvisor/desktop:latest".to_string(),
            command: Vec::new(),
            memory_mb: 4096,
            cpus: 2.0,
            ports: vec![PortRole::Ssh, PortRole::Vnc, PortRole::Web],
            backend: None,
            desktop: true,
            flags: Vec::new(),
        },
    );
    presets.insert(
        "vm".to_string(),
        PresetConfig {
            image: "lab.qcow2".to_string(),
            command: Vec::new(),
            memory_mb: 2048,
            cpus: 2.0,
            ports: vec![PortRole::Ssh, PortRole::Vnc],
            backend: Some(BackendKind::Vm),
            desktop: false,
            flags: Vec::new(),
        },
    );
    presets
}

/// Resolved on-disk locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => expand_path(path)?,
            None => default_config_dir()?.join("config.toml"),
        };
        Ok(Self { config_file })
    }
}

impl std::fmt::Display for AppPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

/// Load configuration, writing a default file first when none exists.
pub fn load_or_init(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() && !dry_run {
        write_default_config(&paths.config_file)?;
    }
    load_from(&paths.config_file)
}

/// Load configuration from `path` (optional) layered with environment overrides.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .context("building configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    config.backend.vm.work_dir = expand_str_path(&config.backend.vm.work_dir)?
        .display()
        .to_string();
    config.backend.vm.template_path = expand_str_path(&config.backend.vm.template_path)?
        .display()
        .to_string();
    if let Some(ref key) = config.backend.vm.ssh_key_path {
        config.backend.vm.ssh_key_path = Some(expand_str_path(key)?.display().to_string());
    }

    config.validate()?;
    Ok(config)
}

impl AppConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, range) in [
            ("ssh", self.ports.ssh),
            ("vnc", self.ports.vnc),
            ("web", self.ports.web),
        ] {
            if range.is_empty() || range.start == 0 {
                anyhow::bail!("invalid {} port range {}..={}", name, range.start, range.end);
            }
        }
        let ranges = [self.ports.ssh, self.ports.vnc, self.ports.web];
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                if a.start <= b.end && b.start <= a.end {
                    anyhow::bail!("port ranges must not overlap");
                }
            }
        }
        if self.presets.is_empty() {
            anyhow::bail!("at least one preset must be configured");
        }
        for (name, preset) in &self.presets {
            if preset.memory_mb == 0 || preset.cpus <= 0.0 {
                anyhow::bail!("preset {} must be given memory and cpus", name);
            }
        }
        Ok(())
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_ship_the_standard_presets() {
        let config = AppConfig::default();
        assert!(config.presets.contains_key("minimal"));
        assert_eq!(config.presets["vm"].backend, Some(BackendKind::Vm));
        assert!(config.presets["desktop"].ports.contains(&PortRole::Vnc));
        config.validate().unwrap();
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ports.ssh, PortRange::new(10000, 10999));
        assert_eq!(config.sessions.lab_timeout_minutes, 60);
        assert!(config.presets.contains_key("minimal"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[sessions]\nlab_timeout_minutes = 15\n\n[ports.ssh]\nstart = 20000\nend = 20009\n",
        )
        .unwrap();
        let config = load_from(&path).unwrap();
        assert_eq!(config.sessions.lab_timeout_minutes, 15);
        assert_eq!(config.ports.ssh.len(), 10);
        assert_eq!(config.sessions.max_sessions_per_user, 3);
    }

    #[test]
    fn default_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for labvisor"));
        let config = load_from(&path).unwrap();
        assert_eq!(config.presets.len(), 4);
    }

    #[test]
    fn overlapping_port_ranges_are_rejected() {
        let mut config = AppConfig::default();
        config.ports.vnc = PortRange::new(10500, 11500);
        assert!(config.validate().is_err());
    }
}
