//! Backend drivers.
//!
//! One [`BackendDriver`] implementation per compute-unit kind: containers via
//! the docker/podman CLI, pods via the Kubernetes API, and QEMU VMs tracked by
//! PID file. The registry picks a driver once per session and never branches on
//! the backend kind anywhere else.

mod container;
mod detect;
mod error;
mod kube;
mod pod;
mod readiness;
mod vm;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use labvisor_protocol::{BackendKind, PortRole};

pub use container::{
    ContainerDriver, ContainerRuntime, ContainerRuntimeApi, LabelledContainer, RuntimeType,
};
pub use detect::{DriverSet, build_drivers, detect_default_backend, detect_transport};
pub use error::{BackendError, BackendResult};
pub use kube::{
    CHANNEL_STATUS, CHANNEL_STDERR, CHANNEL_STDOUT, ExecSocket, ExecStream, KubeClient, stdin_frame,
};
pub use pod::{PodApi, PodDriver};
pub use readiness::wait_until_ready;
pub use vm::{VmDriver, VmMetadata};

/// Label marking every resource this engine creates.
pub const LABEL_MANAGED: &str = "labvisor.managed";
/// Label carrying the owning session ID.
pub const LABEL_SESSION: &str = "labvisor.session";
/// Label carrying the owning user ID.
pub const LABEL_USER: &str = "labvisor.user";

/// Everything a driver needs to create one compute unit.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub session_id: String,
    pub user_id: String,
    /// Unit name (container name, pod name, VM name).
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub memory_mb: u32,
    pub cpus: f32,
    /// Host port per role. The guest side is [`PortRole::guest_port`].
    pub ports: BTreeMap<PortRole, u16>,
    /// Shared home volume for persistent kinds.
    pub volume: Option<String>,
    /// Isolated network for the unit.
    pub network: Option<String>,
    /// Mount point of the shared volume inside the unit.
    pub home_dir: String,
    pub labels: BTreeMap<String, String>,
    /// Expose the remote-display service (pods get a Service for it).
    pub desktop: bool,
}

impl WorkloadSpec {
    /// Ownership labels every driver attaches.
    pub fn ownership_labels(session_id: &str, user_id: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());
        labels.insert(LABEL_USER.to_string(), user_id.to_string());
        labels
    }
}

/// Opaque reference to a live compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub backend: BackendKind,
    /// Runtime ID (container ID, pod UID, VM name).
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

impl ResourceHandle {
    /// Handle derived from the `WorkloadSpec` alone, for tearing down a unit whose
    /// `start` never returned (cancelled or failed half-way).
    pub fn provisional(backend: BackendKind, spec: &WorkloadSpec) -> Self {
        Self {
            backend,
            id: spec.name.clone(),
            name: spec.name.clone(),
            namespace: None,
            network: spec.network.clone(),
            pid_file: None,
        }
    }
}

/// Live status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Running,
    Stopped,
    Unknown,
}

/// Output of a non-interactive command run inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How a terminal bridge reaches a shell inside the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Spawn a local program on a PTY (`docker exec -it`, `kubectl exec -it`, `ssh -tt`).
    Command { program: String, args: Vec<String> },
    /// Open the Kubernetes exec streaming API directly.
    PodExec {
        namespace: String,
        pod: String,
        container: String,
        command: Vec<String>,
    },
}

/// A unit found on the backend that carries our ownership labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedUnit {
    pub session_id: String,
    pub handle: ResourceHandle,
}

/// Start, inspect, stop and attach to one kind of compute unit.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create and start a unit. "Already exists" is success.
    async fn start(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle>;

    /// Live status. A vanished unit is `Stopped`, not an error.
    async fn status(&self, handle: &ResourceHandle) -> BackendResult<UnitStatus>;

    /// Whether the unit can accept work. Pods override this to require every
    /// container to report ready.
    async fn is_ready(&self, handle: &ResourceHandle) -> BackendResult<bool> {
        Ok(self.status(handle).await? == UnitStatus::Running)
    }

    /// Graceful stop with `grace`, then force. Never fails on a missing unit.
    async fn stop(&self, handle: &ResourceHandle, grace: Duration) -> BackendResult<()>;

    /// Run a command to completion inside the unit.
    async fn exec(&self, handle: &ResourceHandle, argv: &[String]) -> BackendResult<ExecOutput>;

    /// Where to attach an interactive `shell`.
    fn attach_target(&self, handle: &ResourceHandle, shell: &str) -> AttachTarget;

    /// Open a native streaming attach for an [`AttachTarget::PodExec`].
    async fn open_exec_stream(&self, target: &AttachTarget) -> BackendResult<ExecStream> {
        let _ = target;
        Err(BackendError::InvalidInput(format!(
            "{} backend has no streaming attach",
            self.kind()
        )))
    }

    /// Units on the backend labelled as ours, live or not.
    async fn list_owned(&self) -> BackendResult<Vec<OwnedUnit>>;
}

/// Validate a unit or resource name before it reaches a CLI or URL.
pub(crate) fn validate_unit_name(name: &str) -> BackendResult<()> {
    if name.is_empty() {
        return Err(BackendError::InvalidInput(
            "unit name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(BackendError::InvalidInput(
            "unit name exceeds maximum length".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "unit name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Validate an image reference (container image or VM template name).
pub(crate) fn validate_image_name(image: &str) -> BackendResult<()> {
    if image.is_empty() {
        return Err(BackendError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(BackendError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    if image.contains("..") {
        return Err(BackendError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// Validate an environment variable key.
pub(crate) fn validate_env_key(key: &str) -> BackendResult<()> {
    let mut chars = key.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_first || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BackendError::InvalidInput(format!(
            "invalid environment variable name '{}'",
            key
        )));
    }
    Ok(())
}
