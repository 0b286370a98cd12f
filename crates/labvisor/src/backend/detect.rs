//! Backend and terminal-transport selection at startup.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use labvisor_protocol::BackendKind;

use super::{BackendDriver, ContainerDriver, ContainerRuntime, KubeClient, PodDriver, VmDriver};
use crate::config::{AppConfig, BackendMode, TransportChoice};

/// Whether an executable named `name` is on `PATH` (or is itself a path).
pub fn binary_on_path(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

/// Pick the default backend: pods inside a cluster, containers elsewhere.
pub fn detect_default_backend(mode: BackendMode) -> BackendKind {
    match mode {
        BackendMode::Container => BackendKind::Container,
        BackendMode::Pod => BackendKind::Pod,
        BackendMode::Auto => {
            if env::var_os("KUBERNETES_SERVICE_HOST").is_some_and(|v| !v.is_empty()) {
                BackendKind::Pod
            } else {
                BackendKind::Container
            }
        }
    }
}

/// Resolve the pod terminal transport: subprocess when `kubectl` is installed.
pub fn detect_transport(choice: TransportChoice, kubectl_binary: &str) -> TransportChoice {
    match choice {
        TransportChoice::Auto => {
            if binary_on_path(kubectl_binary) {
                TransportChoice::Subprocess
            } else {
                TransportChoice::Stream
            }
        }
        other => other,
    }
}

/// The drivers available to this process, keyed by kind.
#[derive(Clone)]
pub struct DriverSet {
    default: BackendKind,
    drivers: BTreeMap<BackendKind, Arc<dyn BackendDriver>>,
}

impl DriverSet {
    pub fn new(default: BackendKind) -> Self {
        Self {
            default,
            drivers: BTreeMap::new(),
        }
    }

    pub fn with(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    pub fn default_kind(&self) -> BackendKind {
        self.default
    }

    /// Backend kind for a preset, honouring a pinned backend.
    pub fn kind_for(&self, pinned: Option<BackendKind>) -> BackendKind {
        pinned.unwrap_or(self.default)
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.drivers.keys().copied().collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn BackendDriver>> {
        self.drivers.values()
    }
}

/// Build the driver set from configuration.
///
/// The default backend is always present. The VM driver is added as well so
/// presets can pin `backend = "vm"` in either deployment.
pub fn build_drivers(config: &AppConfig) -> Result<DriverSet> {
    let default = detect_default_backend(config.backend.mode);
    let mut set = DriverSet::new(default);

    match default {
        BackendKind::Container => {
            let runtime = ContainerRuntime::from_config(&config.backend.container);
            info!("Container backend using {}", runtime.runtime_type());
            set = set.with(Arc::new(ContainerDriver::new(Arc::new(runtime))));
        }
        BackendKind::Pod => {
            let kube = &config.backend.kubernetes;
            let client = KubeClient::from_config(kube).context("building kubernetes client")?;
            let transport = detect_transport(config.terminal.transport, &kube.kubectl_binary);
            info!(
                "Pod backend using {} in namespace {} (terminal transport: {:?})",
                client.base_url(),
                kube.namespace,
                transport
            );
            set = set.with(Arc::new(PodDriver::new(
                Arc::new(client),
                kube.namespace.clone(),
                kube.kubectl_binary.clone(),
                transport,
            )));
        }
        BackendKind::Vm => {}
    }

    set = set.with(Arc::new(VmDriver::new(config.backend.vm.clone())));
    Ok(set)
}
