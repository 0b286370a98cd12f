//! Preset resolution: config preset plus caller overrides.

use std::collections::BTreeMap;

use labvisor_protocol::{BackendKind, FlagSpec, PortRole, SessionKind, StartSessionRequest};

use crate::backend::DriverSet;
use crate::config::AppConfig;
use crate::error::{LabError, LabResult};

const MIN_MEMORY_MB: u32 = 64;
const MAX_MEMORY_MB: u32 = 64 * 1024;
const MAX_CPUS: f32 = 16.0;
const MAX_TIMEOUT_MINUTES: u32 = 24 * 60;

/// Environment variables the engine sets itself.
const RESERVED_ENV: &[&str] = &["LAB_PASSWORD", "LAB_USER", "LAB_SESSION_ID"];

/// Everything needed to launch a session, after overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPreset {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub memory_mb: u32,
    pub cpus: f32,
    pub ports: Vec<PortRole>,
    pub backend: BackendKind,
    pub desktop: bool,
    pub env: BTreeMap<String, String>,
    pub flags: Vec<FlagSpec>,
    pub timeout_minutes: u32,
}

pub fn resolve(
    config: &AppConfig,
    drivers: &DriverSet,
    request: &StartSessionRequest,
) -> LabResult<ResolvedPreset> {
    let preset = config
        .presets
        .get(&request.preset)
        .ok_or_else(|| LabError::InvalidRequest(format!("unknown preset '{}'", request.preset)))?;

    if request.kind == SessionKind::PersistentDesktop && !preset.desktop {
        return Err(LabError::InvalidRequest(format!(
            "preset '{}' has no remote display",
            request.preset
        )));
    }

    let backend = drivers.kind_for(preset.backend);
    if drivers.get(backend).is_none() {
        return Err(LabError::BackendUnavailable(format!(
            "{} backend is not available in this deployment",
            backend
        )));
    }

    let default_timeout = if request.kind.is_persistent() {
        config.sessions.persistent_timeout_minutes
    } else {
        config.sessions.lab_timeout_minutes
    };

    let mut resolved = ResolvedPreset {
        name: request.preset.clone(),
        image: preset.image.clone(),
        command: preset.command.clone(),
        memory_mb: preset.memory_mb,
        cpus: preset.cpus,
        ports: preset.ports.clone(),
        backend,
        desktop: preset.desktop,
        env: BTreeMap::new(),
        flags: preset.flags.clone(),
        timeout_minutes: default_timeout,
    };
    resolved.ports.sort();
    resolved.ports.dedup();

    let Some(ref overrides) = request.overrides else {
        return Ok(resolved);
    };

    if let Some(ref image) = overrides.image {
        if image.trim().is_empty() {
            return Err(LabError::InvalidRequest("image override is empty".into()));
        }
        resolved.image = image.clone();
    }
    if let Some(memory_mb) = overrides.memory_mb {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory_mb) {
            return Err(LabError::InvalidRequest(format!(
                "memory must be between {} and {} MB",
                MIN_MEMORY_MB, MAX_MEMORY_MB
            )));
        }
        resolved.memory_mb = memory_mb;
    }
    if let Some(cpus) = overrides.cpus {
        if !(cpus > 0.0 && cpus <= MAX_CPUS) {
            return Err(LabError::InvalidRequest(format!(
                "cpus must be greater than 0 and at most {}",
                MAX_CPUS
            )));
        }
        resolved.cpus = cpus;
    }
    if let Some(minutes) = overrides.timeout_minutes {
        if minutes == 0 || minutes > MAX_TIMEOUT_MINUTES {
            return Err(LabError::InvalidRequest(format!(
                "timeout must be between 1 and {} minutes",
                MAX_TIMEOUT_MINUTES
            )));
        }
        resolved.timeout_minutes = minutes;
    }
    for (key, value) in &overrides.env {
        if RESERVED_ENV.contains(&key.as_str()) {
            return Err(LabError::InvalidRequest(format!(
                "environment variable {} is reserved",
                key
            )));
        }
        resolved.env.insert(key.clone(), value.clone());
    }
    if !overrides.flags.is_empty() {
        resolved.flags = overrides.flags.clone();
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContainerDriver, ContainerRuntime, RuntimeType};
    use labvisor_protocol::ConfigOverrides;
    use std::sync::Arc;

    fn drivers() -> DriverSet {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        DriverSet::new(BackendKind::Container)
            .with(Arc::new(ContainerDriver::new(Arc::new(runtime))))
    }

    fn request(kind: SessionKind, preset: &str, overrides: Option<ConfigOverrides>) -> StartSessionRequest {
        StartSessionRequest {
            session_id: None,
            user_id: "u1".into(),
            kind,
            preset: preset.into(),
            lab_id: None,
            overrides,
        }
    }

    #[test]
    fn defaults_come_from_the_preset() {
        let config = AppConfig::default();
        let resolved =
            resolve(&config, &drivers(), &request(SessionKind::EphemeralLab, "minimal", None))
                .unwrap();
        assert_eq!(resolved.ports, vec![PortRole::Ssh]);
        assert_eq!(resolved.backend, BackendKind::Container);
        assert_eq!(resolved.timeout_minutes, 60);

        let resolved = resolve(
            &config,
            &drivers(),
            &request(SessionKind::PersistentTerminal, "minimal", None),
        )
        .unwrap();
        assert_eq!(resolved.timeout_minutes, 240);
    }

    #[test]
    fn overrides_are_applied_and_checked() {
        let config = AppConfig::default();
        let mut overrides = ConfigOverrides {
            memory_mb: Some(1024),
            timeout_minutes: Some(15),
            ..Default::default()
        };
        overrides.env.insert("TARGET".into(), "10.0.0.5".into());
        let resolved = resolve(
            &config,
            &drivers(),
            &request(SessionKind::EphemeralLab, "pentest", Some(overrides)),
        )
        .unwrap();
        assert_eq!(resolved.memory_mb, 1024);
        assert_eq!(resolved.timeout_minutes, 15);
        assert_eq!(resolved.env["TARGET"], "10.0.0.5");

        let bad = ConfigOverrides {
            cpus: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&config, &drivers(), &request(SessionKind::EphemeralLab, "minimal", Some(bad))),
            Err(LabError::InvalidRequest(_))
        ));

        let mut reserved = ConfigOverrides::default();
        reserved.env.insert("LAB_PASSWORD".into(), "x".into());
        assert!(
            resolve(
                &config,
                &drivers(),
                &request(SessionKind::EphemeralLab, "minimal", Some(reserved))
            )
            .is_err()
        );
    }

    #[test]
    fn unknown_preset_and_missing_backend() {
        let config = AppConfig::default();
        assert!(matches!(
            resolve(&config, &drivers(), &request(SessionKind::EphemeralLab, "nope", None)),
            Err(LabError::InvalidRequest(_))
        ));
        // The vm preset pins a backend this driver set lacks.
        assert!(matches!(
            resolve(&config, &drivers(), &request(SessionKind::EphemeralLab, "vm", None)),
            Err(LabError::BackendUnavailable(_))
        ));
        assert!(matches!(
            resolve(
                &config,
                &drivers(),
                &request(SessionKind::PersistentDesktop, "minimal", None)
            ),
            Err(LabError::InvalidRequest(_))
        ));
    }
}
