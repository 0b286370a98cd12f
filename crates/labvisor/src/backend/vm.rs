//! QEMU/KVM driver.
//!
//! Each VM runs on a copy-on-write overlay of a template image. The hypervisor
//! daemonizes, so the only handle we keep is its PID file plus a small JSON
//! metadata file next to it; both live in `work_dir` and are how orphans are
//! found after a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rustix::process::{Pid, Signal, kill_process, test_kill_process};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use labvisor_protocol::{BackendKind, PortRole};

use super::{
    AttachTarget, BackendDriver, BackendError, BackendResult, ExecOutput, OwnedUnit,
    ResourceHandle, UnitStatus, WorkloadSpec, validate_env_key, validate_image_name,
    validate_unit_name,
};
use crate::config::VmConfig;

/// QEMU VNC displays are offsets from this port.
const VNC_BASE_PORT: u16 = 5900;

/// Grace given to a leftover VM that has to make way for a fresh launch.
const STALE_STOP_GRACE: Duration = Duration::from_secs(5);

/// Sidecar record describing a launched VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMetadata {
    pub session_id: String,
    pub user_id: String,
    pub name: String,
    pub ssh_port: Option<u16>,
    /// Host port per role as forwarded at launch.
    #[serde(default)]
    pub ports: BTreeMap<PortRole, u16>,
    pub overlay: PathBuf,
    /// Overlay is private to this VM and removed on stop.
    pub ephemeral_overlay: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VmDriver {
    config: VmConfig,
    work_dir: PathBuf,
}

impl VmDriver {
    pub fn new(config: VmConfig) -> Self {
        let work_dir = PathBuf::from(&config.work_dir);
        Self { config, work_dir }
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{}.pid", name))
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{}.json", name))
    }

    fn vnc_socket_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{}.vnc", name))
    }

    /// Persistent kinds keep an overlay per user and environment so the disk
    /// survives restarts. Terminal and desktop VMs never open the same image.
    fn overlay_path(&self, spec: &WorkloadSpec) -> (PathBuf, bool) {
        match spec.volume {
            Some(ref volume) => {
                let flavour = if spec.desktop { "desktop" } else { "terminal" };
                (
                    self.work_dir.join(format!("{}-{}.qcow2", volume, flavour)),
                    false,
                )
            }
            None => (self.work_dir.join(format!("{}.qcow2", spec.name)), true),
        }
    }

    /// Resolve a preset image to a template file next to the default template.
    /// Only plain relative paths are accepted.
    fn template_for(&self, image: &str) -> BackendResult<PathBuf> {
        let default = PathBuf::from(&self.config.template_path);
        if image.is_empty() {
            return Ok(default);
        }
        let relative = Path::new(image);
        if !relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
        {
            return Err(BackendError::InvalidInput(format!(
                "vm image must be a path below the template directory: {}",
                image
            )));
        }
        Ok(match default.parent() {
            Some(dir) => dir.join(relative),
            None => relative.to_path_buf(),
        })
    }

    fn read_metadata(&self, name: &str) -> Option<VmMetadata> {
        let raw = std::fs::read_to_string(self.metadata_path(name)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn read_pid(path: &Path) -> Option<Pid> {
        let raw = std::fs::read_to_string(path).ok()?;
        let pid: i32 = raw.trim().parse().ok()?;
        Pid::from_raw(pid)
    }

    fn pid_alive(pid: Pid) -> bool {
        test_kill_process(pid).is_ok()
    }

    fn pid_file_of(&self, handle: &ResourceHandle) -> PathBuf {
        handle
            .pid_file
            .clone()
            .unwrap_or_else(|| self.pid_path(&handle.name))
    }

    fn handle_for(&self, name: &str) -> ResourceHandle {
        ResourceHandle {
            backend: BackendKind::Vm,
            id: name.to_string(),
            name: name.to_string(),
            namespace: None,
            network: None,
            pid_file: Some(self.pid_path(name)),
        }
    }

    pub fn qemu_args(&self, spec: &WorkloadSpec, overlay: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-name".into(), spec.name.clone()];

        if self.config.enable_kvm {
            args.push("-enable-kvm".into());
            args.push("-cpu".into());
            args.push("host".into());
        }
        args.push("-m".into());
        args.push(spec.memory_mb.to_string());
        args.push("-smp".into());
        args.push((spec.cpus.ceil() as u32).max(1).to_string());

        args.push("-drive".into());
        args.push(format!(
            "file={},if=virtio,format=qcow2",
            qemu_escape(&overlay.display().to_string())
        ));

        let mut netdev = "user,id=net0".to_string();
        for (role, host_port) in &spec.ports {
            if *role == PortRole::Vnc {
                continue;
            }
            netdev.push_str(&format!(
                ",hostfwd=tcp::{}-:{}",
                host_port,
                role.guest_port()
            ));
        }
        args.push("-netdev".into());
        args.push(netdev);
        args.push("-device".into());
        args.push("virtio-net-pci,netdev=net0".into());

        args.push("-vnc".into());
        match spec.ports.get(&PortRole::Vnc) {
            Some(port) if *port >= VNC_BASE_PORT => {
                args.push(format!(":{}", port - VNC_BASE_PORT));
            }
            _ => {
                args.push(format!(
                    "unix:{}",
                    qemu_escape(&self.vnc_socket_path(&spec.name).display().to_string())
                ));
            }
        }

        for (key, value) in &spec.env {
            args.push("-fw_cfg".into());
            args.push(format!(
                "name=opt/labvisor/{},string={}",
                key.to_ascii_lowercase(),
                qemu_escape(value)
            ));
        }

        args.push("-display".into());
        args.push("none".into());
        args.push("-daemonize".into());
        args.push("-pidfile".into());
        args.push(self.pid_path(&spec.name).display().to_string());
        args
    }

    fn ssh_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(ref key) = self.config.ssh_key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    fn ssh_port_of(&self, handle: &ResourceHandle) -> BackendResult<u16> {
        self.read_metadata(&handle.name)
            .and_then(|m| m.ssh_port)
            .ok_or_else(|| BackendError::NotFound(format!("ssh port for vm {}", handle.name)))
    }

    async fn create_overlay(&self, template: &Path, overlay: &Path) -> BackendResult<()> {
        let output = Command::new(&self.config.qemu_img_binary)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(template)
            .arg(overlay)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.config.qemu_img_binary, e))?;
        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command: "qemu-img create".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn remove_file(path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    /// Remove every per-VM file; persistent overlays stay.
    async fn cleanup_files(&self, name: &str) {
        if let Some(meta) = self.read_metadata(name)
            && meta.ephemeral_overlay
        {
            Self::remove_file(&meta.overlay).await;
        }
        Self::remove_file(&self.pid_path(name)).await;
        Self::remove_file(&self.vnc_socket_path(name)).await;
        Self::remove_file(&self.metadata_path(name)).await;
    }
}

fn spawn_error(binary: &str, e: std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::Unavailable(format!("{} is not installed", binary))
    } else {
        BackendError::Io(e)
    }
}

/// QEMU option values escape commas by doubling them.
fn qemu_escape(value: &str) -> String {
    value.replace(',', ",,")
}

/// Quote one argument for a POSIX shell.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '='))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[async_trait]
impl BackendDriver for VmDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    async fn start(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle> {
        validate_unit_name(&spec.name)?;
        validate_image_name(&spec.image)?;
        for key in spec.env.keys() {
            validate_env_key(key)?;
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;

        if let Some(pid) = Self::read_pid(&self.pid_path(&spec.name))
            && Self::pid_alive(pid)
        {
            let matches = self
                .read_metadata(&spec.name)
                .is_some_and(|m| m.session_id == spec.session_id && m.ports == spec.ports);
            if matches {
                info!("VM {} already running, adopting", spec.name);
                return Ok(self.handle_for(&spec.name));
            }
            info!(
                "VM {} is running with different forwards, relaunching",
                spec.name
            );
            self.stop(&self.handle_for(&spec.name), STALE_STOP_GRACE).await?;
        }

        let template = self.template_for(&spec.image)?;
        if !tokio::fs::try_exists(&template).await? {
            return Err(BackendError::NotFound(format!(
                "vm template {}",
                template.display()
            )));
        }

        let (overlay, ephemeral_overlay) = self.overlay_path(spec);
        if !tokio::fs::try_exists(&overlay).await? {
            self.create_overlay(&template, &overlay).await?;
        }

        let metadata = VmMetadata {
            session_id: spec.session_id.clone(),
            user_id: spec.user_id.clone(),
            name: spec.name.clone(),
            ssh_port: spec.ports.get(&PortRole::Ssh).copied(),
            ports: spec.ports.clone(),
            overlay: overlay.clone(),
            ephemeral_overlay,
            created_at: Utc::now(),
        };
        let body = serde_json::to_string_pretty(&metadata)
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        tokio::fs::write(self.metadata_path(&spec.name), body).await?;

        let args = self.qemu_args(spec, &overlay);
        debug!("Launching {} {}", self.config.qemu_binary, args.join(" "));
        let launched = Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.config.qemu_binary, e));

        let failure = match launched {
            Ok(output) if output.status.success() => None,
            Ok(output) => Some(BackendError::CommandFailed {
                command: "qemu".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            self.cleanup_files(&spec.name).await;
            return Err(err);
        }

        info!(
            "Launched VM {} for session {} (overlay {})",
            spec.name,
            spec.session_id,
            overlay.display()
        );
        Ok(self.handle_for(&spec.name))
    }

    async fn status(&self, handle: &ResourceHandle) -> BackendResult<UnitStatus> {
        let pid_file = self.pid_file_of(handle);
        match Self::read_pid(&pid_file) {
            Some(pid) if Self::pid_alive(pid) => Ok(UnitStatus::Running),
            Some(_) => {
                debug!("Removing stale pid file {}", pid_file.display());
                Self::remove_file(&pid_file).await;
                Ok(UnitStatus::Stopped)
            }
            None => Ok(UnitStatus::Stopped),
        }
    }

    async fn is_ready(&self, handle: &ResourceHandle) -> BackendResult<bool> {
        if self.status(handle).await? != UnitStatus::Running {
            return Ok(false);
        }
        let Ok(port) = self.ssh_port_of(handle) else {
            return Ok(true);
        };
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        Ok(matches!(
            tokio::time::timeout(Duration::from_secs(2), connect).await,
            Ok(Ok(_))
        ))
    }

    async fn stop(&self, handle: &ResourceHandle, grace: Duration) -> BackendResult<()> {
        let pid_file = self.pid_file_of(handle);
        if let Some(pid) = Self::read_pid(&pid_file)
            && Self::pid_alive(pid)
        {
            if let Err(e) = kill_process(pid, Signal::TERM) {
                debug!("SIGTERM to vm {} failed: {}", handle.name, e);
            }
            let start = tokio::time::Instant::now();
            while Self::pid_alive(pid) && start.elapsed() < grace {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if Self::pid_alive(pid) {
                warn!(
                    "VM {} ignored SIGTERM for {:?}, killing",
                    handle.name, grace
                );
                if let Err(e) = kill_process(pid, Signal::KILL) {
                    debug!("SIGKILL to vm {} failed: {}", handle.name, e);
                }
                let start = tokio::time::Instant::now();
                while Self::pid_alive(pid) && start.elapsed() < Duration::from_secs(5) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if Self::pid_alive(pid) {
                    return Err(BackendError::Timeout(grace + Duration::from_secs(5)));
                }
            }
        }

        self.cleanup_files(&handle.name).await;
        info!("Stopped VM {}", handle.name);
        Ok(())
    }

    async fn exec(&self, handle: &ResourceHandle, argv: &[String]) -> BackendResult<ExecOutput> {
        let port = self.ssh_port_of(handle)?;
        let remote: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        let output = Command::new("ssh")
            .args(self.ssh_args(port))
            .args(["-o", "BatchMode=yes"])
            .arg(format!("{}@127.0.0.1", self.config.ssh_user))
            .arg("--")
            .arg(remote.join(" "))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error("ssh", e))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn attach_target(&self, handle: &ResourceHandle, shell: &str) -> AttachTarget {
        let port = self
            .read_metadata(&handle.name)
            .and_then(|m| m.ssh_port)
            .unwrap_or(PortRole::Ssh.guest_port());
        let mut args = vec!["-tt".to_string()];
        args.extend(self.ssh_args(port));
        args.push(format!("{}@127.0.0.1", self.config.ssh_user));
        args.push(shell.to_string());
        AttachTarget::Command {
            program: "ssh".to_string(),
            args,
        }
    }

    async fn list_owned(&self) -> BackendResult<Vec<OwnedUnit>> {
        let mut entries = match tokio::fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut by_name: BTreeMap<String, OwnedUnit> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_metadata(name) {
                Some(meta) => {
                    by_name.insert(
                        meta.name.clone(),
                        OwnedUnit {
                            session_id: meta.session_id,
                            handle: self.handle_for(&meta.name),
                        },
                    );
                }
                None => debug!("Skipping unreadable vm metadata {}", path.display()),
            }
        }
        Ok(by_name.into_values().collect())
    }
}
