//! Session data exchanged with the web layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::verify::FlagSpec;

/// What kind of environment a session provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Short-lived, per-lab environment torn down when the lab ends.
    EphemeralLab,
    /// Long-lived shell environment reused across labs.
    PersistentTerminal,
    /// Long-lived graphical environment reused across labs.
    PersistentDesktop,
}

impl SessionKind {
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            SessionKind::PersistentTerminal | SessionKind::PersistentDesktop
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::EphemeralLab => "ephemeral_lab",
            SessionKind::PersistentTerminal => "persistent_terminal",
            SessionKind::PersistentDesktop => "persistent_desktop",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ephemeral_lab" | "lab" => Ok(SessionKind::EphemeralLab),
            "persistent_terminal" | "terminal" => Ok(SessionKind::PersistentTerminal),
            "persistent_desktop" | "desktop" => Ok(SessionKind::PersistentDesktop),
            _ => Err(format!("unknown session kind: {}", s)),
        }
    }
}

/// Which compute backend hosts a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Container on the local Docker/Podman runtime.
    Container,
    /// Kubernetes pod.
    Pod,
    /// QEMU/KVM virtual machine.
    Vm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Pod => write!(f, "pod"),
            BackendKind::Vm => write!(f, "vm"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" | "docker" | "podman" => Ok(BackendKind::Container),
            "pod" | "kubernetes" | "k8s" => Ok(BackendKind::Pod),
            "vm" | "qemu" => Ok(BackendKind::Vm),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// Lifecycle state of a session.
///
/// Ephemeral labs move `pending -> provisioning -> running` and end in one of
/// the terminal states. Persistent environments cycle
/// `stopped -> starting -> running -> stopping -> stopped` with `error`
/// reachable from every active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Provisioning,
    Starting,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Terminated,
    Expired,
    Error,
}

impl SessionState {
    /// Terminal states are never left or mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Terminated
                | SessionState::Expired
        )
    }

    /// States in which a backend unit may exist or be in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Pending
                | SessionState::Provisioning
                | SessionState::Starting
                | SessionState::Running
                | SessionState::Stopping
        )
    }

    /// Whether `self -> next` is an edge of the state graph for `kind`.
    pub fn can_transition_to(&self, next: SessionState, kind: SessionKind) -> bool {
        use SessionState::*;

        if kind.is_persistent() {
            matches!(
                (self, next),
                (Pending, Starting)
                    | (Stopped, Starting)
                    | (Error, Starting)
                    | (Starting, Running)
                    | (Running, Stopping)
                    | (Stopping, Stopped)
                    | (Pending, Error)
                    | (Starting, Error)
                    | (Running, Error)
                    | (Stopping, Error)
            )
        } else {
            matches!(
                (self, next),
                (Pending, Provisioning)
                    | (Pending, Failed)
                    | (Provisioning, Running)
                    | (Provisioning, Failed)
                    | (Running, Completed)
                    | (Running, Failed)
                    | (Running, Terminated)
                    | (Running, Expired)
            )
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Provisioning => "provisioning",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Terminated => "terminated",
            SessionState::Expired => "expired",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network port roles a preset may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    Ssh,
    Vnc,
    Web,
}

impl PortRole {
    /// Port the service listens on inside the unit.
    pub fn guest_port(&self) -> u16 {
        match self {
            PortRole::Ssh => 22,
            PortRole::Vnc => 5901,
            PortRole::Web => 6080,
        }
    }
}

impl std::fmt::Display for PortRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortRole::Ssh => write!(f, "ssh"),
            PortRole::Vnc => write!(f, "vnc"),
            PortRole::Web => write!(f, "web"),
        }
    }
}

/// Caller-supplied tweaks on top of a preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Flags capturable in this session (replaces the preset's flag set).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<FlagSpec>,
}

/// Request to start (or reuse) a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Caller-chosen session ID. Generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    pub kind: SessionKind,
    pub preset: String,
    /// Lab identifier used for idempotent starts. Defaults to the preset name.
    #[serde(default)]
    pub lab_id: Option<String>,
    #[serde(default)]
    pub overrides: Option<ConfigOverrides>,
}

/// Connection details, populated only while a session is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    pub host: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
    pub username: String,
    pub password: String,
}

/// Snapshot of a session as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub user_id: String,
    pub kind: SessionKind,
    pub backend: BackendKind,
    pub preset: String,
    pub lab_id: String,
    pub state: SessionState,
    pub ports: BTreeMap<PortRole, u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub memory_mb: u32,
    pub cpus: f32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessInfo>,
    /// Whole minutes the session has been running, for quota accounting.
    pub usage_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
