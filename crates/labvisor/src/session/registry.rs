//! The session registry: sole owner of session records and the only place
//! lifecycle transitions happen.
//!
//! Locking:
//! - a per-user async lock serializes `start_session` for one user, which
//!   makes the idempotency check and the per-user cap exact;
//! - a per-session async lock serializes every lifecycle operation on one
//!   session (start, stop, status reconciliation, terminal attach);
//! - the record itself sits behind a plain mutex that is never held across
//!   an `.await`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use rand::distr::{Alphanumeric, SampleString};
use uuid::Uuid;

use labvisor_protocol::{
    AccessInfo, BackendKind, FlagResult, LifecycleEvent, PortRole, SessionKind, SessionState,
    SessionView, StartSessionRequest, VerifyOutcome, VerifyRule,
};

use super::events::EventHub;
use super::models::{Session, SessionKey, StopReason};
use super::presets::{self, ResolvedPreset};
use crate::allocator::{PortAllocator, network_name_for, unit_name_for, volume_for_session};
use crate::backend::{
    BackendDriver, DriverSet, ExecOutput, ResourceHandle, UnitStatus, WorkloadSpec,
    wait_until_ready,
};
use crate::config::AppConfig;
use crate::error::{LabError, LabResult};
use crate::terminal::{InputTap, TerminalBridge, TerminalError};
use crate::verifier::{FlagBoard, ScriptRunner, Verifier, VerifyError};

const PASSWORD_LEN: usize = 20;
const MAX_SESSION_ID_LEN: usize = 64;

/// Result of [`SessionRegistry::start_session`].
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session: SessionView,
    /// An already-active session was returned instead of starting one.
    pub reused: bool,
}

struct SessionSlot {
    op: tokio::sync::Mutex<()>,
    record: Mutex<Session>,
    bridge: Mutex<Option<Arc<TerminalBridge>>>,
}

impl SessionSlot {
    fn new(record: Session) -> Self {
        Self {
            op: tokio::sync::Mutex::new(()),
            record: Mutex::new(record),
            bridge: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Session {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    fn take_bridge(&self) -> Option<Arc<TerminalBridge>> {
        self.bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_bridge(&self, bridge: Arc<TerminalBridge>) {
        *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
    }

    fn current_bridge(&self) -> Option<Arc<TerminalBridge>> {
        self.bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Single authority over sessions.
pub struct SessionRegistry {
    config: AppConfig,
    drivers: DriverSet,
    sessions: DashMap<String, Arc<SessionSlot>>,
    by_key: DashMap<SessionKey, String>,
    user_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Sessions in a terminal state, kept for status queries until pruned.
    ended: DashMap<String, Session>,
    ports: Mutex<PortAllocator>,
    events: EventHub,
    verifier: Arc<Verifier>,
    flags: FlagBoard,
}

impl SessionRegistry {
    pub fn new(config: AppConfig, drivers: DriverSet) -> Self {
        let ports = PortAllocator::new(config.ports.clone());
        Self {
            config,
            drivers,
            sessions: DashMap::new(),
            by_key: DashMap::new(),
            user_locks: DashMap::new(),
            ended: DashMap::new(),
            ports: Mutex::new(ports),
            events: EventHub::new(),
            verifier: Arc::new(Verifier::default()),
            flags: FlagBoard::new(),
        }
    }

    /// Replace the port allocator (deterministic seeds in tests).
    pub fn with_port_allocator(mut self, allocator: PortAllocator) -> Self {
        self.ports = Mutex::new(allocator);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn drivers(&self) -> &DriverSet {
        &self.drivers
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Number of host ports currently held by sessions.
    pub fn held_ports(&self) -> usize {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held_count()
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    fn slot_for_key(&self, key: &SessionKey) -> Option<Arc<SessionSlot>> {
        let id = self.by_key.get(key).map(|id| id.value().clone())?;
        self.slot(&id)
    }

    fn ended_view(&self, session_id: &str) -> LabResult<SessionView> {
        self.ended
            .get(session_id)
            .map(|s| s.to_view(Utc::now()))
            .ok_or_else(|| LabError::NotFound(session_id.to_string()))
    }

    // ---------------------------------------------------------------------
    // start
    // ---------------------------------------------------------------------

    /// Start a session, or return the active one for the same user, kind and
    /// lab. Persistent sessions that are stopped or errored are restarted
    /// under their original ID.
    pub async fn start_session(&self, request: StartSessionRequest) -> LabResult<StartOutcome> {
        if request.user_id.trim().is_empty() {
            return Err(LabError::InvalidRequest("user_id is required".into()));
        }
        let preset = presets::resolve(&self.config, &self.drivers, &request)?;
        let key = SessionKey {
            user_id: request.user_id.clone(),
            kind: request.kind,
            lab_id: request
                .lab_id
                .clone()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| request.preset.clone()),
        };

        let user_lock = Arc::clone(
            self.user_locks
                .entry(key.user_id.clone())
                .or_default()
                .value(),
        );
        let _user_guard = user_lock.lock().await;

        if let Some(slot) = self.slot_for_key(&key) {
            let _op = slot.op.lock().await;
            let current = slot.snapshot();
            if current.state.is_active() {
                debug!(
                    "Session {} already {} for user {} lab {}",
                    current.id, current.state, key.user_id, key.lab_id
                );
                return Ok(StartOutcome {
                    session: current.to_view(Utc::now()),
                    reused: true,
                });
            }
            if current.kind.is_persistent()
                && matches!(current.state, SessionState::Stopped | SessionState::Error)
            {
                self.check_user_cap(&key.user_id)?;
                info!(
                    "Restarting persistent session {} for user {}",
                    current.id, key.user_id
                );
                let session = self.launch_locked(&slot, &preset).await?;
                return Ok(StartOutcome {
                    session,
                    reused: false,
                });
            }
            self.by_key.remove_if(&key, |_, id| *id == current.id);
        }

        let session_id = match request.session_id {
            Some(ref id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => Uuid::new_v4().to_string(),
        };
        self.check_user_cap(&key.user_id)?;

        let record = Session::new(
            session_id.clone(),
            &key,
            preset.backend,
            preset.name.clone(),
            unit_name_for(&session_id),
            Utc::now(),
        );
        let slot = Arc::new(SessionSlot::new(record));
        let _op = slot.op.lock().await;
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => return Err(LabError::AlreadyActive(session_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }
        // `retire` files a record under `ended` before dropping it from
        // `sessions`, so a vacant slot with an `ended` record is a spent ID.
        if self.ended.contains_key(&session_id) {
            self.sessions
                .remove_if(&session_id, |_, held| Arc::ptr_eq(held, &slot));
            return Err(LabError::InvalidRequest(format!(
                "session id '{}' belongs to an ended session",
                session_id
            )));
        }
        self.by_key.insert(key, session_id);

        let session = self.launch_locked(&slot, &preset).await?;
        Ok(StartOutcome {
            session,
            reused: false,
        })
    }

    fn check_user_cap(&self, user_id: &str) -> LabResult<()> {
        let cap = self.config.sessions.max_sessions_per_user;
        if cap == 0 {
            return Ok(());
        }
        let active = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .update(|s| s.user_id == user_id && s.state.is_active())
            })
            .count();
        if active >= cap {
            return Err(LabError::LimitReached(active));
        }
        Ok(())
    }

    /// Allocate, provision and wait for readiness. Caller holds the slot's
    /// operation lock. Any failure runs the full cleanup path.
    async fn launch_locked(
        &self,
        slot: &SessionSlot,
        preset: &ResolvedPreset,
    ) -> LabResult<SessionView> {
        let prepared = slot.update(|s| -> LabResult<(String, String, SessionKind, String)> {
            let next = if s.kind.is_persistent() {
                SessionState::Starting
            } else {
                SessionState::Provisioning
            };
            s.transition(next)?;
            s.backend = preset.backend;
            s.preset = preset.name.clone();
            s.memory_mb = preset.memory_mb;
            s.cpus = preset.cpus;
            s.timeout_minutes = preset.timeout_minutes;
            s.volume = volume_for_session(&s.user_id, s.kind);
            s.error_message = None;
            s.ended_at = None;
            Ok((s.id.clone(), s.user_id.clone(), s.kind, s.unit_name.clone()))
        });
        let (session_id, user_id, kind, unit_name) = prepared?;

        let allocated = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate_ports(&preset.ports, &session_id);
        let ports = match allocated {
            Ok(ports) => ports,
            Err(e) => return Err(self.fail_start(slot, e, None).await),
        };

        let Some(driver) = self.drivers.get(preset.backend) else {
            let err = LabError::BackendUnavailable(format!("{} backend", preset.backend));
            return Err(self.fail_start(slot, err, None).await);
        };

        let password = Alphanumeric.sample_string(&mut rand::rng(), PASSWORD_LEN);
        let network =
            (preset.backend == BackendKind::Container).then(|| network_name_for(&session_id));
        let volume = volume_for_session(&user_id, kind);

        let mut env = preset.env.clone();
        env.insert("LAB_PASSWORD".into(), password.clone());
        env.insert("LAB_USER".into(), self.config.access.username.clone());
        env.insert("LAB_SESSION_ID".into(), session_id.clone());

        let spec = WorkloadSpec {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            name: unit_name,
            image: preset.image.clone(),
            command: preset.command.clone(),
            env,
            memory_mb: preset.memory_mb,
            cpus: preset.cpus,
            ports: ports.clone(),
            volume,
            network: network.clone(),
            home_dir: format!("/home/{}", self.config.access.username),
            labels: WorkloadSpec::ownership_labels(&session_id, &user_id),
            desktop: preset.desktop,
        };

        slot.update(|s| {
            s.ports = ports;
            s.network = network;
            s.password = password.clone();
        });

        info!(
            "Provisioning session {} ({}, preset {}) on {}",
            session_id, kind, preset.name, preset.backend
        );

        let start_timeout = self.config.sessions.start_timeout();
        let interval =
            Duration::from_secs(self.config.readiness.interval_secs).max(Duration::from_millis(50));
        let ready_timeout = Duration::from_secs(self.config.readiness.timeout_secs);
        let attempt = async {
            let handle = match driver.start(&spec).await {
                Ok(handle) => handle,
                Err(e) => return Err((LabError::from(e), None)),
            };
            match wait_until_ready(driver.as_ref(), &handle, interval, ready_timeout).await {
                Ok(()) => Ok(handle),
                Err(e) => Err((LabError::from(e), Some(handle))),
            }
        };
        let outcome = match tokio::time::timeout(start_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err((
                LabError::ProvisionTimeout {
                    after: start_timeout,
                },
                None,
            )),
        };
        let handle = match outcome {
            Ok(handle) => handle,
            Err((err, handle)) => {
                // A cancelled start leaves no handle; derive one from the unit spec.
                let handle =
                    handle.unwrap_or_else(|| ResourceHandle::provisional(preset.backend, &spec));
                return Err(self
                    .fail_start(slot, err, Some((driver.as_ref(), handle)))
                    .await);
            }
        };

        let now = Utc::now();
        let promoted = slot.update(|s| -> LabResult<SessionView> {
            s.transition(SessionState::Running)?;
            s.handle = Some(handle.clone());
            s.started_at = Some(now);
            s.last_activity_at = now;
            s.expires_at = Some(now + ChronoDuration::minutes(s.timeout_minutes as i64));
            s.access = Some(self.access_for(s, preset.desktop));
            Ok(s.to_view(now))
        });
        let view = match promoted {
            Ok(view) => view,
            Err(e) => return Err(self.fail_start(slot, e, Some((driver.as_ref(), handle))).await),
        };

        self.flags.configure(&session_id, preset.flags.clone());
        self.events.emit(LifecycleEvent::Started {
            session_id,
            user_id,
            kind,
            backend: preset.backend,
            at: now,
        });
        Ok(view)
    }

    /// Roll back a failed start: tear the unit down, release ports, record
    /// the failure. Returns the error to surface.
    async fn fail_start(
        &self,
        slot: &SessionSlot,
        err: LabError,
        teardown: Option<(&dyn BackendDriver, ResourceHandle)>,
    ) -> LabError {
        let session_id = slot.update(|s| s.id.clone());
        warn!("Session {} failed to start: {}", session_id, err);

        if let Some((driver, handle)) = teardown {
            self.teardown_unit(driver, &handle, &session_id).await;
        }
        self.release_ports(&session_id);

        let now = Utc::now();
        let message = err.to_string();
        let (user_id, kind) = slot.update(|s| {
            let failed = if s.kind.is_persistent() {
                SessionState::Error
            } else {
                SessionState::Failed
            };
            if let Err(e) = s.transition(failed) {
                warn!("Session {}: {}", s.id, e);
            }
            s.error_message = Some(message.clone());
            s.end_run(now);
            (s.user_id.clone(), s.kind)
        });

        self.events.emit(LifecycleEvent::Error {
            session_id: session_id.clone(),
            user_id,
            message,
            at: now,
        });
        if !kind.is_persistent() {
            self.retire(slot);
        }
        err
    }

    fn access_for(&self, session: &Session, desktop: bool) -> AccessInfo {
        let host = self.config.access.public_host.clone();
        let username = self.config.access.username.clone();
        let ssh_port = session.ports.get(&PortRole::Ssh).copied();
        let vnc_port = session.ports.get(&PortRole::Vnc).copied();
        let web_port = session.ports.get(&PortRole::Web).copied();

        let url = match (desktop, web_port, ssh_port) {
            (true, Some(web), _) => format!("http://{}:{}/vnc.html", host, web),
            (_, _, Some(ssh)) => format!("ssh://{}@{}:{}", username, host, ssh),
            _ => format!("/sessions/{}/terminal", session.id),
        };

        AccessInfo {
            host,
            url,
            ssh_port,
            vnc_port,
            web_port,
            username,
            password: session.password.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // stop
    // ---------------------------------------------------------------------

    /// Stop a session. Ephemeral sessions end (`terminated`, `expired` or
    /// `completed`); persistent ones go `stopping -> stopped`. A backend
    /// stop that times out is logged and the session is ended anyway.
    pub async fn stop_session(&self, session_id: &str, reason: StopReason) -> LabResult<SessionView> {
        let Some(slot) = self.slot(session_id) else {
            return self.ended_view(session_id);
        };
        let _op = slot.op.lock().await;
        let current = slot.snapshot();
        let now = Utc::now();

        if current.state.is_terminal() {
            return Ok(current.to_view(now));
        }
        if current.state != SessionState::Running {
            // Stopped or errored persistent session: nothing is live.
            self.stop_bridge(&slot).await;
            self.release_ports(session_id);
            debug!("Session {} is already {}", session_id, current.state);
            return Ok(current.to_view(now));
        }

        let persistent = current.kind.is_persistent();
        if persistent {
            slot.update(|s| s.transition(SessionState::Stopping))?;
        }
        info!("Stopping session {} ({})", session_id, reason);

        self.stop_bridge(&slot).await;
        if let Some(ref handle) = current.handle {
            match self.drivers.get(handle.backend) {
                Some(driver) => self.teardown_unit(driver.as_ref(), handle, session_id).await,
                None => warn!(
                    "No {} driver to stop session {}",
                    handle.backend, session_id
                ),
            }
        }
        let released = self.release_ports(session_id);

        let now = Utc::now();
        let final_state = if persistent {
            SessionState::Stopped
        } else {
            reason.final_state()
        };
        let (view, usage_minutes) = slot.update(|s| {
            let usage = s.usage_minutes(now);
            if let Err(e) = s.transition(final_state) {
                warn!("Session {}: {}", s.id, e);
            }
            s.end_run(now);
            (s.to_view(now), usage)
        });

        if reason == StopReason::Expired {
            self.events.emit(LifecycleEvent::Expired {
                session_id: session_id.to_string(),
                user_id: current.user_id.clone(),
                at: now,
            });
        }
        self.events.emit(LifecycleEvent::Stopped {
            session_id: session_id.to_string(),
            user_id: current.user_id.clone(),
            reason: reason.to_string(),
            usage_minutes,
            at: now,
        });
        if !persistent {
            self.retire(&slot);
        }
        debug!(
            "Session {} released {} port(s)",
            session_id,
            released.len()
        );
        Ok(view)
    }

    /// Driver stop bounded by the stop timeout. Failures are logged only.
    async fn teardown_unit(&self, driver: &dyn BackendDriver, handle: &ResourceHandle, session_id: &str) {
        let grace = self.config.sessions.stop_grace();
        let limit = self.config.sessions.stop_timeout();
        match tokio::time::timeout(limit, driver.stop(handle, grace)).await {
            Ok(Ok(())) => debug!("Stopped {} for session {}", handle.name, session_id),
            Ok(Err(e)) => warn!(
                "Failed to stop {} for session {}: {}",
                handle.name, session_id, e
            ),
            Err(_) => warn!(
                "Stopping {} for session {} timed out after {}s, removing anyway",
                handle.name,
                session_id,
                limit.as_secs()
            ),
        }
    }

    async fn stop_bridge(&self, slot: &SessionSlot) {
        if let Some(bridge) = slot.take_bridge() {
            bridge.stop().await;
        }
    }

    fn release_ports(&self, session_id: &str) -> Vec<u16> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release_owner(session_id)
    }

    /// Move an ended session out of the live map.
    fn retire(&self, slot: &SessionSlot) {
        let record = slot.snapshot();
        let (id, key) = (record.id.clone(), record.key());
        self.ended.insert(id.clone(), record);
        self.sessions.remove(&id);
        self.by_key.remove_if(&key, |_, held| *held == id);
    }

    // ---------------------------------------------------------------------
    // touch / status / list
    // ---------------------------------------------------------------------

    /// Record activity. `expires_at` only moves when `extend_minutes` is given.
    pub fn touch(&self, session_id: &str, extend_minutes: Option<u32>) -> LabResult<SessionView> {
        let Some(slot) = self.slot(session_id) else {
            return match self.ended.contains_key(session_id) {
                true => Err(LabError::InvalidRequest("session has ended".into())),
                false => Err(LabError::NotFound(session_id.to_string())),
            };
        };
        let max = self.config.sessions.max_extension_minutes;
        let now = Utc::now();
        slot.update(|s| {
            if s.state != SessionState::Running {
                return Err(LabError::InvalidRequest(format!(
                    "session is {}, not running",
                    s.state
                )));
            }
            s.last_activity_at = now;
            if let Some(minutes) = extend_minutes {
                if minutes == 0 || minutes > max {
                    return Err(LabError::InvalidRequest(format!(
                        "extension must be between 1 and {} minutes",
                        max
                    )));
                }
                s.extend(minutes);
                info!("Session {} extended by {} min", s.id, minutes);
            }
            Ok(s.to_view(now))
        })
    }

    /// Session snapshot, reconciled against the backend's live status. A
    /// running record whose unit has vanished is corrected before returning.
    pub async fn status(&self, session_id: &str) -> LabResult<SessionView> {
        let Some(slot) = self.slot(session_id) else {
            return self.ended_view(session_id);
        };
        // An operation in flight owns the record; report it as is.
        let Ok(_op) = slot.op.try_lock() else {
            return Ok(slot.snapshot().to_view(Utc::now()));
        };

        let current = slot.snapshot();
        if let (SessionState::Running, Some(handle)) = (current.state, current.handle.as_ref())
            && let Some(driver) = self.drivers.get(handle.backend)
        {
            let limit = self.config.sessions.stop_timeout();
            match tokio::time::timeout(limit, driver.status(handle)).await {
                Ok(Ok(UnitStatus::Stopped)) => {
                    self.mark_lost(&slot, driver.as_ref(), handle).await;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Status check for session {} failed: {}", session_id, e),
                Err(_) => debug!("Status check for session {} timed out", session_id),
            }
        }
        Ok(slot.snapshot().to_view(Utc::now()))
    }

    /// The unit behind a running session is gone.
    async fn mark_lost(&self, slot: &SessionSlot, driver: &dyn BackendDriver, handle: &ResourceHandle) {
        let session_id = slot_id(slot);
        warn!(
            "Session {} lost its {} {}, correcting record",
            session_id, handle.backend, handle.name
        );
        self.stop_bridge(slot).await;
        // Clears leftovers such as networks and PID files.
        self.teardown_unit(driver, handle, &session_id).await;
        self.release_ports(&session_id);

        let now = Utc::now();
        let message = "lab environment stopped unexpectedly".to_string();
        let (user_id, kind) = slot.update(|s| {
            let next = if s.kind.is_persistent() {
                SessionState::Error
            } else {
                SessionState::Failed
            };
            if let Err(e) = s.transition(next) {
                warn!("Session {}: {}", s.id, e);
            }
            s.error_message = Some(message.clone());
            s.end_run(now);
            (s.user_id.clone(), s.kind)
        });
        self.events.emit(LifecycleEvent::Error {
            session_id,
            user_id,
            message,
            at: now,
        });
        if !kind.is_persistent() {
            self.retire(slot);
        }
    }

    /// Every state the session has been in, oldest first.
    pub fn history(&self, session_id: &str) -> Option<Vec<SessionState>> {
        match self.slot(session_id) {
            Some(slot) => Some(slot.update(|s| s.history.clone())),
            None => self.ended.get(session_id).map(|s| s.history.clone()),
        }
    }

    /// Live and ended sessions, oldest first.
    pub fn list(&self, user_id: Option<&str>) -> Vec<SessionView> {
        let now = Utc::now();
        let mut views: Vec<SessionView> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .chain(self.ended.iter().map(|entry| entry.value().clone()))
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .map(|s| s.to_view(now))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    // ---------------------------------------------------------------------
    // terminal
    // ---------------------------------------------------------------------

    /// Whether [`attach_terminal`](Self::attach_terminal) would be accepted
    /// right now. Opens nothing.
    pub fn check_attachable(&self, session_id: &str, role: &str) -> LabResult<()> {
        if !(role.is_empty() || role == "target") {
            return Err(LabError::InvalidRequest(format!(
                "unknown terminal role '{}'",
                role
            )));
        }
        let Some(slot) = self.slot(session_id) else {
            return match self.ended.contains_key(session_id) {
                true => Err(LabError::AttachFailed("session has ended".into())),
                false => Err(LabError::NotFound(session_id.to_string())),
            };
        };
        match slot.snapshot().state {
            SessionState::Running => Ok(()),
            state => Err(LabError::AttachFailed(format!("session is {}", state))),
        }
    }

    /// Open a fresh terminal bridge into a running session. Any previous
    /// bridge for the session is stopped first: one reader per PTY.
    pub async fn attach_terminal(&self, session_id: &str, role: &str) -> LabResult<Arc<TerminalBridge>> {
        self.check_attachable(session_id, role)?;
        let slot = self
            .slot(session_id)
            .ok_or_else(|| LabError::NotFound(session_id.to_string()))?;
        let _op = slot.op.lock().await;

        let current = slot.snapshot();
        let handle = match (current.state, current.handle) {
            (SessionState::Running, Some(handle)) => handle,
            (state, _) => {
                return Err(LabError::AttachFailed(format!("session is {}", state)));
            }
        };
        let driver = self
            .drivers
            .get(handle.backend)
            .ok_or_else(|| LabError::BackendUnavailable(format!("{} backend", handle.backend)))?;

        self.stop_bridge(&slot).await;
        let tap: Arc<dyn InputTap> = self.verifier.clone();
        let bridge = Arc::new(TerminalBridge::new(
            session_id,
            driver,
            handle,
            self.config.terminal.clone(),
            Some(tap),
        ));
        if !bridge.start().await {
            let reason = bridge
                .last_error()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!("Terminal attach to session {} failed: {}", session_id, reason);
            let message = if reason == TerminalError::NoShell.to_string() {
                reason
            } else {
                crate::error::TERMINAL_FAILED.to_string()
            };
            return Err(LabError::AttachFailed(message));
        }
        slot.set_bridge(Arc::clone(&bridge));
        slot.update(|s| s.last_activity_at = Utc::now());
        Ok(bridge)
    }

    /// Stop a bridge handed out by [`attach_terminal`](Self::attach_terminal)
    /// once its client disconnects.
    pub async fn detach_terminal(&self, session_id: &str, bridge: &Arc<TerminalBridge>) {
        if let Some(slot) = self.slot(session_id)
            && slot
                .current_bridge()
                .is_some_and(|current| Arc::ptr_eq(&current, bridge))
        {
            slot.take_bridge();
        }
        bridge.stop().await;
    }

    // ---------------------------------------------------------------------
    // verification
    // ---------------------------------------------------------------------

    fn ensure_known(&self, session_id: &str) -> LabResult<()> {
        if self.sessions.contains_key(session_id) || self.ended.contains_key(session_id) {
            Ok(())
        } else {
            Err(LabError::NotFound(session_id.to_string()))
        }
    }

    pub async fn verify(&self, session_id: &str, rule: &VerifyRule) -> LabResult<VerifyOutcome> {
        self.ensure_known(session_id)?;
        Ok(self.verifier.verify(session_id, rule, self).await?)
    }

    pub fn commands(&self, session_id: &str) -> LabResult<Vec<String>> {
        self.ensure_known(session_id)?;
        Ok(self.verifier.commands(session_id))
    }

    pub fn submit_flag(&self, session_id: &str, value: &str) -> LabResult<FlagResult> {
        self.ensure_known(session_id)?;
        Ok(self.flags.submit(session_id, value))
    }

    fn running_unit(&self, session_id: &str) -> LabResult<(Arc<dyn BackendDriver>, ResourceHandle)> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| LabError::NotFound(session_id.to_string()))?;
        let current = slot.snapshot();
        match (current.state, current.handle) {
            (SessionState::Running, Some(handle)) => {
                let driver = self.drivers.get(handle.backend).ok_or_else(|| {
                    LabError::BackendUnavailable(format!("{} backend", handle.backend))
                })?;
                Ok((driver, handle))
            }
            (state, _) => Err(LabError::InvalidRequest(format!("session is {}", state))),
        }
    }

    // ---------------------------------------------------------------------
    // reconciler support
    // ---------------------------------------------------------------------

    /// Running sessions whose `expires_at` has passed.
    pub fn expired_session_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().update(|s| s.is_expired(now)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn running_session_ids(&self) -> Vec<String> {
        self.ids_where(|s| s.state == SessionState::Running)
    }

    /// Sessions that may own a backend unit (including ones mid-provision).
    pub fn active_session_ids(&self) -> Vec<String> {
        self.ids_where(|s| s.state.is_active())
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.slot(session_id)
            .is_some_and(|slot| slot.update(|s| s.state.is_active()))
    }

    fn ids_where(&self, pred: impl Fn(&Session) -> bool) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().update(|s| pred(s)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop ended sessions older than `cutoff`, with their command history
    /// and flag captures.
    pub fn prune_ended(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: HashSet<String> = self
            .ended
            .iter()
            .filter(|entry| entry.value().ended_at.is_none_or(|at| at < cutoff))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.ended.remove(id);
            self.verifier.forget(id);
            self.flags.remove(id);
        }
        stale.len()
    }
}

fn slot_id(slot: &SessionSlot) -> String {
    slot.update(|s| s.id.clone())
}

fn validate_session_id(id: &str) -> LabResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LabError::InvalidRequest(format!("invalid session id '{}'", id)))
    }
}

#[async_trait]
impl ScriptRunner for SessionRegistry {
    async fn run_script(
        &self,
        session_id: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, VerifyError> {
        let (driver, handle) = self
            .running_unit(session_id)
            .map_err(|e| VerifyError::Script(e.to_string()))?;
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        match tokio::time::timeout(timeout, driver.exec(&handle, &argv)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(VerifyError::Script(e.to_string())),
            Err(_) => Err(VerifyError::Script(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}
