//! Test utilities: an in-memory backend driver and registry builders.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use labvisor::backend::{
    AttachTarget, BackendDriver, BackendError, BackendResult, DriverSet, ExecOutput, OwnedUnit,
    ResourceHandle, UnitStatus, WorkloadSpec,
};
use labvisor::config::AppConfig;
use labvisor::SessionRegistry;
use labvisor_protocol::{BackendKind, SessionKind, StartSessionRequest};

#[derive(Debug, Clone)]
pub struct FakeUnit {
    pub session_id: String,
    pub running: bool,
    pub spec_volume: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    starts: usize,
    stops: Vec<String>,
    units: BTreeMap<String, FakeUnit>,
    fail_start: Option<String>,
}

/// A driver that keeps units in memory and runs `exec`/attach as local
/// processes, so terminal and script paths see a real shell.
pub struct FakeDriver {
    state: Mutex<FakeState>,
    start_delay: Duration,
    ready: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            start_delay: Duration::ZERO,
            ready: AtomicBool::new(true),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Fail the next `start` the way a runtime CLI would, with `stderr`.
    pub fn fail_next_start(&self, stderr: &str) {
        self.state.lock().unwrap().fail_start = Some(stderr.to_string());
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn unit(&self, name: &str) -> Option<FakeUnit> {
        self.state.lock().unwrap().units.get(name).cloned()
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    /// Make a unit vanish behind the registry's back.
    pub fn lose(&self, name: &str) {
        self.state.lock().unwrap().units.remove(name);
    }

    /// A labelled unit no session in this process knows about.
    pub fn plant_orphan(&self, session_id: &str) -> String {
        let name = format!("lab-{}", session_id);
        self.state.lock().unwrap().units.insert(
            name.clone(),
            FakeUnit {
                session_id: session_id.to_string(),
                running: true,
                spec_volume: None,
                env: BTreeMap::new(),
            },
        );
        name
    }

    fn handle_for(name: &str) -> ResourceHandle {
        ResourceHandle {
            backend: BackendKind::Container,
            id: format!("id-{}", name),
            name: name.to_string(),
            namespace: None,
            network: None,
            pid_file: None,
        }
    }
}

#[async_trait]
impl BackendDriver for FakeDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle> {
        {
            let mut state = self.state.lock().unwrap();
            state.starts += 1;
            if let Some(message) = state.fail_start.take() {
                return Err(BackendError::CommandFailed {
                    command: "run".to_string(),
                    message,
                });
            }
        }
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.state.lock().unwrap().units.insert(
            spec.name.clone(),
            FakeUnit {
                session_id: spec.session_id.clone(),
                running: true,
                spec_volume: spec.volume.clone(),
                env: spec.env.clone(),
            },
        );
        let mut handle = Self::handle_for(&spec.name);
        handle.network = spec.network.clone();
        Ok(handle)
    }

    async fn status(&self, handle: &ResourceHandle) -> BackendResult<UnitStatus> {
        let state = self.state.lock().unwrap();
        Ok(match state.units.get(&handle.name) {
            Some(unit) if unit.running => UnitStatus::Running,
            _ => UnitStatus::Stopped,
        })
    }

    async fn is_ready(&self, handle: &ResourceHandle) -> BackendResult<bool> {
        Ok(self.status(handle).await? == UnitStatus::Running && self.ready.load(Ordering::SeqCst))
    }

    async fn stop(&self, handle: &ResourceHandle, _grace: Duration) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stops.push(handle.name.clone());
        state.units.remove(&handle.name);
        Ok(())
    }

    async fn exec(&self, handle: &ResourceHandle, argv: &[String]) -> BackendResult<ExecOutput> {
        if self.status(handle).await? != UnitStatus::Running {
            return Err(BackendError::NotFound(handle.name.clone()));
        }
        let Some((program, args)) = argv.split_first() else {
            return Err(BackendError::InvalidInput("empty command".into()));
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn attach_target(&self, _handle: &ResourceHandle, shell: &str) -> AttachTarget {
        AttachTarget::Command {
            program: shell.to_string(),
            args: Vec::new(),
        }
    }

    async fn list_owned(&self) -> BackendResult<Vec<OwnedUnit>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .iter()
            .map(|(name, unit)| OwnedUnit {
                session_id: unit.session_id.clone(),
                handle: Self::handle_for(name),
            })
            .collect())
    }
}

/// Defaults tuned for fast tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.sessions.start_timeout_secs = 5;
    config.sessions.stop_timeout_secs = 2;
    config.sessions.stop_grace_secs = 0;
    config.readiness.interval_secs = 0;
    config.readiness.timeout_secs = 2;
    config.terminal.shell_candidates = vec!["/bin/sh".to_string()];
    config
}

pub fn registry_with(config: AppConfig, driver: Arc<FakeDriver>) -> Arc<SessionRegistry> {
    let drivers = DriverSet::new(BackendKind::Container).with(driver);
    Arc::new(SessionRegistry::new(config, drivers))
}

pub fn fake_registry() -> (Arc<SessionRegistry>, Arc<FakeDriver>) {
    let driver = Arc::new(FakeDriver::new());
    (registry_with(test_config(), Arc::clone(&driver)), driver)
}

pub fn request(user: &str, kind: SessionKind, preset: &str, lab: Option<&str>) -> StartSessionRequest {
    StartSessionRequest {
        session_id: None,
        user_id: user.to_string(),
        kind,
        preset: preset.to_string(),
        lab_id: lab.map(str::to_string),
        overrides: None,
    }
}

pub fn have_shell() -> bool {
    Path::new("/bin/sh").exists()
}
