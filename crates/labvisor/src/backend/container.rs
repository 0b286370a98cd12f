//! Container driver.
//!
//! Talks to Docker or Podman through their CLI. The CLI surface is behind
//! [`ContainerRuntimeApi`] so the driver logic can be tested without a daemon.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use labvisor_protocol::BackendKind;

use super::{
    AttachTarget, BackendDriver, BackendError, BackendResult, ExecOutput, LABEL_MANAGED,
    LABEL_SESSION, OwnedUnit, ResourceHandle, UnitStatus, WorkloadSpec, validate_env_key,
    validate_image_name, validate_unit_name,
};
use crate::config::{ContainerBackendConfig, RuntimeChoice};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// A container carrying our ownership label, as found by `ps` + `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledContainer {
    pub id: String,
    pub name: String,
    pub session_id: Option<String>,
    pub network: Option<String>,
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Binary used for interactive attach.
    fn binary(&self) -> &str;
    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>)
    -> BackendResult<()>;
    async fn remove_network(&self, name: &str) -> BackendResult<()>;
    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>)
    -> BackendResult<()>;
    /// `run -d`; returns the container ID.
    async fn run_container(&self, spec: &WorkloadSpec) -> BackendResult<String>;
    async fn container_id(&self, name: &str) -> BackendResult<Option<String>>;
    /// `State.Status` ("running", "exited", ...), `None` when the container is gone.
    async fn container_state_status(&self, id_or_name: &str) -> BackendResult<Option<String>>;
    /// Published TCP bindings as guest port -> host port.
    async fn published_ports(&self, id_or_name: &str) -> BackendResult<BTreeMap<u16, u16>>;
    async fn stop_container(&self, id_or_name: &str, timeout_secs: u64) -> BackendResult<()>;
    async fn remove_container(&self, id_or_name: &str, force: bool) -> BackendResult<()>;
    async fn list_labelled(&self, label: &str) -> BackendResult<Vec<LabelledContainer>>;
    async fn exec_output(&self, id_or_name: &str, argv: &[String]) -> BackendResult<ExecOutput>;
}

/// Docker/Podman CLI client.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl ContainerRuntime {
    /// Resolve the runtime from configuration, probing PATH for `auto`.
    ///
    /// Docker is preferred, then Podman. When neither is installed the docker
    /// binary is kept and calls fail with `Unavailable`.
    pub fn from_config(config: &ContainerBackendConfig) -> Self {
        let runtime_type = match config.runtime {
            RuntimeChoice::Docker => RuntimeType::Docker,
            RuntimeChoice::Podman => RuntimeType::Podman,
            RuntimeChoice::Auto => {
                if super::detect::binary_on_path("docker") {
                    RuntimeType::Docker
                } else if super::detect::binary_on_path("podman") {
                    RuntimeType::Podman
                } else {
                    RuntimeType::Docker
                }
            }
        };
        let binary = config
            .binary
            .clone()
            .unwrap_or_else(|| runtime_type.default_binary().to_string());
        Self {
            runtime_type,
            binary,
        }
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check that the runtime answers at all.
    pub async fn health_check(&self) -> BackendResult<String> {
        self.run_checked("version", &["version".to_string()]).await
    }

    async fn output(&self, command: &str, args: &[String]) -> BackendResult<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BackendError::Unavailable(format!("{} is not installed", self.binary))
                } else {
                    BackendError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    async fn run_checked(&self, command: &str, args: &[String]) -> BackendResult<String> {
        let output = self.output(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(command, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_args(&self, spec: &WorkloadSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];

        args.push("--name".into());
        args.push(spec.name.clone());
        args.push("--hostname".into());
        args.push(spec.name.clone());

        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        args.push("--memory".into());
        args.push(format!("{}m", spec.memory_mb));
        args.push("--cpus".into());
        args.push(format!("{}", spec.cpus));

        if let Some(ref network) = spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        for (role, host_port) in &spec.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", host_port, role.guest_port()));
        }

        if let Some(ref volume) = spec.volume {
            args.push("-v".into());
            args.push(format!("{}:{}", volume, spec.home_dir));
        }

        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

/// Separate daemon outages from ordinary command failures.
fn classify_failure(command: &str, stderr: String) -> BackendError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("unable to connect to podman")
    {
        BackendError::Unavailable(stderr)
    } else {
        BackendError::CommandFailed {
            command: command.to_string(),
            message: stderr,
        }
    }
}

fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{}={}", k, v)])
        .collect()
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    fn binary(&self) -> &str {
        &self.binary
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> BackendResult<()> {
        validate_unit_name(name)?;
        let mut args = vec!["network".to_string(), "create".to_string()];
        args.extend(label_args(labels));
        args.push(name.to_string());
        match self.run_checked("network create", &args).await {
            Err(err) if err.is_already_exists() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn remove_network(&self, name: &str) -> BackendResult<()> {
        validate_unit_name(name)?;
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        match self.run_checked("network rm", &args).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> BackendResult<()> {
        validate_unit_name(name)?;
        let mut args = vec!["volume".to_string(), "create".to_string()];
        args.extend(label_args(labels));
        args.push(name.to_string());
        match self.run_checked("volume create", &args).await {
            Err(err) if err.is_already_exists() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn run_container(&self, spec: &WorkloadSpec) -> BackendResult<String> {
        let args = self.run_args(spec);
        self.run_checked("run", &args).await
    }

    async fn container_id(&self, name: &str) -> BackendResult<Option<String>> {
        validate_unit_name(name)?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];
        let output = self.output("inspect", &args).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    async fn container_state_status(&self, id_or_name: &str) -> BackendResult<Option<String>> {
        validate_unit_name(id_or_name)?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            id_or_name.to_string(),
        ];
        let output = self.output("inspect", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return match classify_failure("inspect", stderr) {
                err @ BackendError::Unavailable(_) => Err(err),
                // Missing container: callers treat it as stopped.
                _ => Ok(None),
            };
        }
        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        Ok((!status.is_empty()).then_some(status))
    }

    async fn published_ports(&self, id_or_name: &str) -> BackendResult<BTreeMap<u16, u16>> {
        validate_unit_name(id_or_name)?;
        let args = vec!["port".to_string(), id_or_name.to_string()];
        let output = self.run_checked("port", &args).await?;
        Ok(parse_port_lines(&output))
    }

    async fn stop_container(&self, id_or_name: &str, timeout_secs: u64) -> BackendResult<()> {
        validate_unit_name(id_or_name)?;
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout_secs.to_string(),
            id_or_name.to_string(),
        ];
        self.run_checked("stop", &args).await.map(|_| ())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> BackendResult<()> {
        validate_unit_name(id_or_name)?;
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id_or_name.to_string());
        self.run_checked("rm", &args).await.map(|_| ())
    }

    async fn list_labelled(&self, label: &str) -> BackendResult<Vec<LabelledContainer>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "-q".to_string(),
            "--filter".to_string(),
            format!("label={}", label),
        ];
        let ids = self.run_checked("ps", &args).await?;

        let mut containers = Vec::new();
        for id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let args = vec![
                "inspect".to_string(),
                "--format".to_string(),
                format!(
                    "{{{{.Name}}}}|{{{{index .Config.Labels \"{}\"}}}}|{{{{range $k, $v := .NetworkSettings.Networks}}}}{{{{$k}}}} {{{{end}}}}",
                    LABEL_SESSION
                ),
                id.to_string(),
            ];
            match self.run_checked("inspect", &args).await {
                Ok(line) => containers.push(parse_inspect_line(id, &line)),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(containers)
    }

    async fn exec_output(&self, id_or_name: &str, argv: &[String]) -> BackendResult<ExecOutput> {
        validate_unit_name(id_or_name)?;
        let mut args = vec!["exec".to_string(), id_or_name.to_string()];
        args.extend(argv.iter().cloned());
        let output = self.output("exec", &args).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Parse `docker port` output (`22/tcp -> 0.0.0.0:10022`). IPv4 and IPv6
/// lines for the same binding collapse into one entry.
fn parse_port_lines(output: &str) -> BTreeMap<u16, u16> {
    let mut ports = BTreeMap::new();
    for line in output.lines() {
        let Some((guest, host)) = line.split_once("->") else {
            continue;
        };
        let Some(guest) = guest.trim().strip_suffix("/tcp") else {
            continue;
        };
        let host = host.trim().rsplit(':').next().unwrap_or_default();
        if let (Ok(guest), Ok(host)) = (guest.parse::<u16>(), host.parse::<u16>()) {
            ports.insert(guest, host);
        }
    }
    ports
}

/// Parse `name|session|net1 net2 ` as printed by our inspect template.
fn parse_inspect_line(id: &str, line: &str) -> LabelledContainer {
    let mut parts = line.splitn(3, '|');
    let name = parts
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('/')
        .to_string();
    let session_id = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "<no value>")
        .map(str::to_string);
    let network = parts.next().and_then(|nets| {
        nets.split_whitespace()
            .find(|n| n.starts_with("labvisor-net-"))
            .map(str::to_string)
    });
    LabelledContainer {
        id: id.to_string(),
        name: if name.is_empty() { id.to_string() } else { name },
        session_id,
        network,
    }
}

/// [`BackendDriver`] for local containers.
#[derive(Clone)]
pub struct ContainerDriver {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl ContainerDriver {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    fn handle_for(&self, spec: &WorkloadSpec, id: String) -> ResourceHandle {
        ResourceHandle {
            backend: BackendKind::Container,
            id,
            name: spec.name.clone(),
            namespace: None,
            network: spec.network.clone(),
            pid_file: None,
        }
    }

    /// Resolve a name clash: reuse a running container whose bindings match the
    /// ports we were given, replace anything else.
    async fn adopt_existing(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle> {
        let status = self.runtime.container_state_status(&spec.name).await?;
        if status.as_deref() == Some("running") {
            let expected: BTreeMap<u16, u16> = spec
                .ports
                .iter()
                .map(|(role, host)| (role.guest_port(), *host))
                .collect();
            let published = self.runtime.published_ports(&spec.name).await?;
            if published == expected {
                let id = self
                    .runtime
                    .container_id(&spec.name)
                    .await?
                    .unwrap_or_else(|| spec.name.clone());
                info!("Container {} already running, adopting", spec.name);
                return Ok(self.handle_for(spec, id));
            }
            info!(
                "Container {} is bound to {:?}, expected {:?}; recreating",
                spec.name, published, expected
            );
        } else {
            info!(
                "Replacing leftover container {} (state {:?})",
                spec.name, status
            );
        }
        if let Err(e) = self.runtime.remove_container(&spec.name, true).await
            && !e.is_not_found()
        {
            return Err(e);
        }
        let id = self.runtime.run_container(spec).await?;
        Ok(self.handle_for(spec, id))
    }

    async fn rollback_network(&self, spec: &WorkloadSpec) {
        if let Some(ref network) = spec.network
            && let Err(e) = self.runtime.remove_network(network).await
        {
            debug!("Rollback of network {} failed: {}", network, e);
        }
    }
}

#[async_trait]
impl BackendDriver for ContainerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle> {
        validate_unit_name(&spec.name)?;
        validate_image_name(&spec.image)?;
        for key in spec.env.keys() {
            validate_env_key(key)?;
        }

        if let Some(ref network) = spec.network {
            self.runtime.create_network(network, &spec.labels).await?;
        }
        if let Some(ref volume) = spec.volume {
            let mut labels = BTreeMap::new();
            labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
            if let Err(e) = self.runtime.create_volume(volume, &labels).await {
                self.rollback_network(spec).await;
                return Err(e);
            }
        }

        let result = match self.runtime.run_container(spec).await {
            Ok(id) => Ok(self.handle_for(spec, id)),
            Err(err) if err.is_already_exists() => self.adopt_existing(spec).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(handle) => {
                info!(
                    "Started container {} for session {}",
                    spec.name, spec.session_id
                );
                Ok(handle)
            }
            Err(err) => {
                // Volumes are shared per user and outlive sessions; only the network is ours.
                self.rollback_network(spec).await;
                Err(err)
            }
        }
    }

    async fn status(&self, handle: &ResourceHandle) -> BackendResult<UnitStatus> {
        let status = self.runtime.container_state_status(&handle.id).await?;
        Ok(match status.as_deref() {
            None => UnitStatus::Stopped,
            Some("running") => UnitStatus::Running,
            Some("exited") | Some("dead") | Some("removing") | Some("stopped") => {
                UnitStatus::Stopped
            }
            Some(_) => UnitStatus::Unknown,
        })
    }

    async fn stop(&self, handle: &ResourceHandle, grace: Duration) -> BackendResult<()> {
        if let Err(e) = self
            .runtime
            .stop_container(&handle.id, grace.as_secs())
            .await
        {
            if matches!(e, BackendError::Unavailable(_)) {
                return Err(e);
            }
            debug!(
                "Stop container {} (may already be stopped): {}",
                handle.name, e
            );
        }

        match self.runtime.remove_container(&handle.id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if let Some(ref network) = handle.network
            && let Err(e) = self.runtime.remove_network(network).await
        {
            warn!("Failed to remove network {}: {}", network, e);
        }

        info!("Removed container {}", handle.name);
        Ok(())
    }

    async fn exec(&self, handle: &ResourceHandle, argv: &[String]) -> BackendResult<ExecOutput> {
        self.runtime.exec_output(&handle.id, argv).await
    }

    fn attach_target(&self, handle: &ResourceHandle, shell: &str) -> AttachTarget {
        AttachTarget::Command {
            program: self.runtime.binary().to_string(),
            args: vec![
                "exec".to_string(),
                "-it".to_string(),
                "-e".to_string(),
                "TERM=xterm-256color".to_string(),
                handle.id.clone(),
                shell.to_string(),
            ],
        }
    }

    async fn list_owned(&self) -> BackendResult<Vec<OwnedUnit>> {
        let containers = self
            .runtime
            .list_labelled(&format!("{}=true", LABEL_MANAGED))
            .await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let session_id = c.session_id?;
                Some(OwnedUnit {
                    session_id,
                    handle: ResourceHandle {
                        backend: BackendKind::Container,
                        id: c.id,
                        name: c.name,
                        namespace: None,
                        network: c.network,
                        pid_file: None,
                    },
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_protocol::PortRole;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        containers: BTreeMap<String, (String, String)>,
        bindings: BTreeMap<String, BTreeMap<u16, u16>>,
        networks: Vec<String>,
        volumes: Vec<String>,
        calls: Vec<String>,
        fail_run: Option<String>,
    }

    #[derive(Default)]
    struct FakeRuntime {
        state: Mutex<FakeState>,
    }

    #[async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        fn binary(&self) -> &str {
            "docker"
        }

        async fn create_network(
            &self,
            name: &str,
            _labels: &BTreeMap<String, String>,
        ) -> BackendResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("network create {name}"));
            if !state.networks.iter().any(|n| n == name) {
                state.networks.push(name.to_string());
            }
            Ok(())
        }

        async fn remove_network(&self, name: &str) -> BackendResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("network rm {name}"));
            state.networks.retain(|n| n != name);
            Ok(())
        }

        async fn create_volume(
            &self,
            name: &str,
            _labels: &BTreeMap<String, String>,
        ) -> BackendResult<()> {
            let mut state = self.state.lock().unwrap();
            if !state.volumes.iter().any(|v| v == name) {
                state.volumes.push(name.to_string());
            }
            Ok(())
        }

        async fn run_container(&self, spec: &WorkloadSpec) -> BackendResult<String> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("run {}", spec.name));
            if let Some(message) = state.fail_run.clone() {
                return Err(BackendError::CommandFailed {
                    command: "run".into(),
                    message,
                });
            }
            if state.containers.contains_key(&spec.name) {
                return Err(BackendError::CommandFailed {
                    command: "run".into(),
                    message: format!("the container name \"{}\" is already in use", spec.name),
                });
            }
            let id = format!("id-{}", spec.name);
            let bindings = spec
                .ports
                .iter()
                .map(|(role, host)| (role.guest_port(), *host))
                .collect();
            state.bindings.insert(spec.name.clone(), bindings);
            state
                .containers
                .insert(spec.name.clone(), (id.clone(), "running".into()));
            Ok(id)
        }

        async fn container_id(&self, name: &str) -> BackendResult<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.containers.get(name).map(|(id, _)| id.clone()))
        }

        async fn container_state_status(
            &self,
            id_or_name: &str,
        ) -> BackendResult<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .find(|(name, (id, _))| *name == id_or_name || id == id_or_name)
                .map(|(_, (_, status))| status.clone()))
        }

        async fn published_ports(&self, id_or_name: &str) -> BackendResult<BTreeMap<u16, u16>> {
            let state = self.state.lock().unwrap();
            Ok(state.bindings.get(id_or_name).cloned().unwrap_or_default())
        }

        async fn stop_container(&self, id_or_name: &str, _timeout_secs: u64) -> BackendResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("stop {id_or_name}"));
            match state
                .containers
                .iter_mut()
                .find(|(name, (id, _))| *name == id_or_name || id == id_or_name)
            {
                Some((_, (_, status))) => {
                    *status = "exited".into();
                    Ok(())
                }
                None => Err(BackendError::CommandFailed {
                    command: "stop".into(),
                    message: format!("Error: No such container: {id_or_name}"),
                }),
            }
        }

        async fn remove_container(&self, id_or_name: &str, _force: bool) -> BackendResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("rm {id_or_name}"));
            let before = state.containers.len();
            state
                .containers
                .retain(|name, (id, _)| name != id_or_name && id != id_or_name);
            if state.containers.len() == before {
                return Err(BackendError::CommandFailed {
                    command: "rm".into(),
                    message: format!("Error: No such container: {id_or_name}"),
                });
            }
            Ok(())
        }

        async fn list_labelled(&self, _label: &str) -> BackendResult<Vec<LabelledContainer>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .map(|(name, (id, _))| LabelledContainer {
                    id: id.clone(),
                    name: name.clone(),
                    session_id: name.strip_prefix("lab-").map(str::to_string),
                    network: None,
                })
                .collect())
        }

        async fn exec_output(
            &self,
            _id_or_name: &str,
            argv: &[String],
        ) -> BackendResult<ExecOutput> {
            Ok(ExecOutput {
                exit_code: if argv.iter().any(|a| a == "/bin/bash") { 0 } else { 1 },
                ..Default::default()
            })
        }
    }

    fn spec(name: &str) -> WorkloadSpec {
        let mut ports = BTreeMap::new();
        ports.insert(PortRole::Ssh, 10022);
        WorkloadSpec {
            session_id: "s1".into(),
            user_id: "u1".into(),
            name: name.into(),
            image: "labvisor/minimal:latest".into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            memory_mb: 512,
            cpus: 0.5,
            ports,
            volume: Some("labvisor-home-abc".into()),
            network: Some("labvisor-net-abc".into()),
            home_dir: "/home/student".into(),
            labels: WorkloadSpec::ownership_labels("s1", "u1"),
            desktop: false,
        }
    }

    fn driver() -> (Arc<FakeRuntime>, ContainerDriver) {
        let runtime = Arc::new(FakeRuntime::default());
        (runtime.clone(), ContainerDriver::new(runtime))
    }

    #[test]
    fn run_args_carry_labels_limits_ports_and_volume() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman);
        let args = runtime.run_args(&spec("lab-1"));
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name lab-1"));
        assert!(joined.contains("--label labvisor.session=s1"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("-p 10022:22"));
        assert!(joined.contains("-v labvisor-home-abc:/home/student"));
        assert!(joined.contains("--network labvisor-net-abc"));
        assert_eq!(args.last().map(String::as_str), Some("labvisor/minimal:latest"));
    }

    #[test]
    fn inspect_line_parsing() {
        let c = parse_inspect_line("abc", "/lab-1|sess-9|bridge labvisor-net-ff ");
        assert_eq!(c.name, "lab-1");
        assert_eq!(c.session_id.as_deref(), Some("sess-9"));
        assert_eq!(c.network.as_deref(), Some("labvisor-net-ff"));

        let c = parse_inspect_line("abc", "/other|<no value>|");
        assert_eq!(c.session_id, None);
        assert_eq!(c.network, None);
    }

    #[tokio::test]
    async fn start_creates_network_and_volume() {
        let (runtime, driver) = driver();
        let handle = driver.start(&spec("lab-1")).await.unwrap();
        assert_eq!(handle.id, "id-lab-1");
        assert_eq!(handle.network.as_deref(), Some("labvisor-net-abc"));
        let state = runtime.state.lock().unwrap();
        assert_eq!(state.networks, vec!["labvisor-net-abc".to_string()]);
        assert_eq!(state.volumes, vec!["labvisor-home-abc".to_string()]);
    }

    #[tokio::test]
    async fn start_adopts_running_container_with_same_name() {
        let (runtime, driver) = driver();
        let first = driver.start(&spec("lab-1")).await.unwrap();
        let second = driver.start(&spec("lab-1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(runtime.state.lock().unwrap().containers.len(), 1);
    }

    #[tokio::test]
    async fn start_recreates_running_container_with_stale_ports() {
        let (runtime, driver) = driver();
        driver.start(&spec("lab-1")).await.unwrap();

        let mut moved = spec("lab-1");
        moved.ports.insert(PortRole::Ssh, 10023);
        driver.start(&moved).await.unwrap();

        let state = runtime.state.lock().unwrap();
        assert!(state.calls.contains(&"rm lab-1".to_string()));
        assert_eq!(state.bindings["lab-1"].get(&22), Some(&10023));
        assert_eq!(state.containers.len(), 1);
    }

    #[test]
    fn port_output_parsing() {
        let ports = parse_port_lines(
            "22/tcp -> 0.0.0.0:10022\n22/tcp -> [::]:10022\n6080/tcp -> 0.0.0.0:11001\n53/udp -> 0.0.0.0:5353\n",
        );
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[&22], 10022);
        assert_eq!(ports[&6080], 11001);
    }

    #[tokio::test]
    async fn start_replaces_exited_leftover() {
        let (runtime, driver) = driver();
        driver.start(&spec("lab-1")).await.unwrap();
        runtime
            .state
            .lock()
            .unwrap()
            .containers
            .get_mut("lab-1")
            .unwrap()
            .1 = "exited".into();
        driver.start(&spec("lab-1")).await.unwrap();
        let state = runtime.state.lock().unwrap();
        assert_eq!(state.containers["lab-1"].1, "running");
        assert!(state.calls.contains(&"rm lab-1".to_string()));
    }

    #[tokio::test]
    async fn failed_run_rolls_back_network() {
        let (runtime, driver) = driver();
        runtime.state.lock().unwrap().fail_run = Some("image not known".into());
        let err = driver.start(&spec("lab-1")).await.unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { .. }));
        assert!(runtime.state.lock().unwrap().networks.is_empty());
    }

    #[tokio::test]
    async fn missing_container_reads_as_stopped_and_stop_is_quiet() {
        let (_runtime, driver) = driver();
        let handle = ResourceHandle::provisional(BackendKind::Container, &spec("lab-gone"));
        assert_eq!(driver.status(&handle).await.unwrap(), UnitStatus::Stopped);
        driver.stop(&handle, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_removes_container_and_network() {
        let (runtime, driver) = driver();
        let handle = driver.start(&spec("lab-1")).await.unwrap();
        driver.stop(&handle, Duration::from_secs(1)).await.unwrap();
        let state = runtime.state.lock().unwrap();
        assert!(state.containers.is_empty());
        assert!(state.networks.is_empty());
        assert_eq!(state.volumes.len(), 1);
    }

    #[tokio::test]
    async fn list_owned_reports_session_ids() {
        let (_runtime, driver) = driver();
        driver.start(&spec("lab-s7")).await.unwrap();
        let owned = driver.list_owned().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].session_id, "s7");
    }

    #[test]
    fn attach_uses_interactive_exec() {
        let (_runtime, driver) = driver();
        let handle = ResourceHandle::provisional(BackendKind::Container, &spec("lab-1"));
        match driver.attach_target(&handle, "/bin/bash") {
            AttachTarget::Command { program, args } => {
                assert_eq!(program, "docker");
                assert_eq!(args.first().map(String::as_str), Some("exec"));
                assert_eq!(args.last().map(String::as_str), Some("/bin/bash"));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }
}
