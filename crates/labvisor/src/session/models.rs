//! Session records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use labvisor_protocol::{
    AccessInfo, BackendKind, PortRole, SessionKind, SessionState, SessionView,
};

use crate::backend::ResourceHandle;
use crate::error::{LabError, LabResult};

/// Why a session is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// Explicit stop from the caller.
    #[default]
    Requested,
    /// The lab objective was met.
    Completed,
    /// `expires_at` passed.
    Expired,
    /// Process shutdown.
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::Completed => "completed",
            StopReason::Expired => "expired",
            StopReason::Shutdown => "shutdown",
        }
    }

    /// Terminal state an ephemeral session ends in.
    pub fn final_state(&self) -> SessionState {
        match self {
            StopReason::Completed => SessionState::Completed,
            StopReason::Expired => SessionState::Expired,
            StopReason::Requested | StopReason::Shutdown => SessionState::Terminated,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "requested" | "user" => Ok(StopReason::Requested),
            "completed" => Ok(StopReason::Completed),
            "expired" => Ok(StopReason::Expired),
            "shutdown" => Ok(StopReason::Shutdown),
            _ => Err(format!("unknown stop reason: {}", s)),
        }
    }
}

/// Idempotency key: one active session per user, kind and lab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub kind: SessionKind,
    pub lab_id: String,
}

/// The registry's record of one session. Only the registry mutates it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub kind: SessionKind,
    pub backend: BackendKind,
    pub preset: String,
    pub lab_id: String,
    pub state: SessionState,
    pub memory_mb: u32,
    pub cpus: f32,
    pub timeout_minutes: u32,
    pub ports: BTreeMap<PortRole, u16>,
    pub volume: Option<String>,
    pub network: Option<String>,
    pub unit_name: String,
    pub handle: Option<ResourceHandle>,
    pub password: String,
    pub access: Option<AccessInfo>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Running time of earlier runs (persistent restarts).
    pub prior_usage_secs: i64,
    pub error_message: Option<String>,
    /// Every state this record has been in, in order.
    pub history: Vec<SessionState>,
}

impl Session {
    pub fn new(
        id: String,
        key: &SessionKey,
        backend: BackendKind,
        preset: String,
        unit_name: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: key.user_id.clone(),
            kind: key.kind,
            backend,
            preset,
            lab_id: key.lab_id.clone(),
            state: SessionState::Pending,
            memory_mb: 0,
            cpus: 0.0,
            timeout_minutes: 0,
            ports: BTreeMap::new(),
            volume: None,
            network: None,
            unit_name,
            handle: None,
            password: String::new(),
            access: None,
            created_at: now,
            started_at: None,
            last_activity_at: now,
            expires_at: None,
            ended_at: None,
            prior_usage_secs: 0,
            error_message: None,
            history: vec![SessionState::Pending],
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            user_id: self.user_id.clone(),
            kind: self.kind,
            lab_id: self.lab_id.clone(),
        }
    }

    /// Move along an edge of the state graph, or refuse.
    pub fn transition(&mut self, next: SessionState) -> LabResult<()> {
        if !self.state.can_transition_to(next, self.kind) {
            return Err(LabError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Running && self.expires_at.is_some_and(|at| now > at)
    }

    /// Close out the current run: fold its duration into the usage total and
    /// clear everything that only exists while running.
    pub fn end_run(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.started_at.take() {
            self.prior_usage_secs += (now - started).num_seconds().max(0);
        }
        self.handle = None;
        self.access = None;
        self.ports.clear();
        self.network = None;
        self.expires_at = None;
        self.ended_at = Some(now);
    }

    /// Whole minutes of running time, including the current run.
    pub fn usage_minutes(&self, now: DateTime<Utc>) -> i64 {
        let current = self
            .started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);
        (self.prior_usage_secs + current) / 60
    }

    pub fn extend(&mut self, minutes: u32) {
        if let Some(at) = self.expires_at {
            self.expires_at = Some(at + ChronoDuration::minutes(minutes as i64));
        }
    }

    pub fn to_view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            kind: self.kind,
            backend: self.backend,
            preset: self.preset.clone(),
            lab_id: self.lab_id.clone(),
            state: self.state,
            ports: self.ports.clone(),
            volume: self.volume.clone(),
            network: self.network.clone(),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            created_at: self.created_at,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            ended_at: self.ended_at,
            access: if self.state == SessionState::Running {
                self.access.clone()
            } else {
                None
            },
            usage_minutes: self.usage_minutes(now),
            error_message: self.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(kind: SessionKind) -> Session {
        let key = SessionKey {
            user_id: "u1".into(),
            kind,
            lab_id: "lab".into(),
        };
        Session::new(
            "s1".into(),
            &key,
            BackendKind::Container,
            "minimal".into(),
            "lab-s1".into(),
            Utc::now(),
        )
    }

    #[test]
    fn refuses_edges_outside_the_graph() {
        let mut s = session(SessionKind::EphemeralLab);
        assert!(matches!(
            s.transition(SessionState::Running),
            Err(LabError::InvalidTransition { .. })
        ));
        s.transition(SessionState::Provisioning).unwrap();
        s.transition(SessionState::Running).unwrap();
        s.transition(SessionState::Expired).unwrap();
        assert!(s.transition(SessionState::Running).is_err());
        assert_eq!(
            s.history,
            vec![
                SessionState::Pending,
                SessionState::Provisioning,
                SessionState::Running,
                SessionState::Expired
            ]
        );
    }

    #[test]
    fn usage_accumulates_across_runs() {
        let mut s = session(SessionKind::PersistentTerminal);
        let t0 = Utc::now();
        s.started_at = Some(t0);
        s.end_run(t0 + ChronoDuration::minutes(10));
        s.started_at = Some(t0 + ChronoDuration::minutes(20));
        assert_eq!(s.usage_minutes(t0 + ChronoDuration::minutes(25)), 15);
    }

    #[test]
    fn access_only_visible_while_running() {
        let mut s = session(SessionKind::EphemeralLab);
        s.access = Some(AccessInfo {
            host: "localhost".into(),
            url: "ssh://student@localhost:10001".into(),
            ssh_port: Some(10001),
            vnc_port: None,
            web_port: None,
            username: "student".into(),
            password: "pw".into(),
        });
        assert!(s.to_view(Utc::now()).access.is_none());
        s.transition(SessionState::Provisioning).unwrap();
        s.transition(SessionState::Running).unwrap();
        assert!(s.to_view(Utc::now()).access.is_some());
    }

    #[test]
    fn stop_reason_maps_to_final_state() {
        assert_eq!(StopReason::Expired.final_state(), SessionState::Expired);
        assert_eq!("".parse::<StopReason>().unwrap(), StopReason::Requested);
        assert_eq!(StopReason::Shutdown.final_state(), SessionState::Terminated);
    }
}
