//! Lifecycle reconciler tests, plus a property test over random
//! start/stop/expire sequences checking that recorded state histories follow
//! the graph.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use labvisor::allocator::unit_name_for;
use labvisor::{LabError, Reconciler, StopReason, SweepReport};
use labvisor_protocol::{LifecycleEvent, SessionKind, SessionState};

mod common;
use common::{FakeDriver, fake_registry, registry_with, request, test_config};

#[tokio::test]
async fn sweep_expires_overdue_sessions() {
    let mut config = test_config();
    config.sessions.lab_timeout_minutes = 0;
    let driver = Arc::new(FakeDriver::new());
    let registry = registry_with(config, Arc::clone(&driver));
    let mut events = registry.events().subscribe();

    let view = registry
        .start_session(request("u1", SessionKind::EphemeralLab, "minimal", None))
        .await
        .unwrap()
        .session;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = Reconciler::new(Arc::clone(&registry)).sweep_once().await;
    assert_eq!(report.expired, 1);

    let status = registry.status(&view.id).await.unwrap();
    assert_eq!(status.state, SessionState::Expired);
    assert_eq!(registry.held_ports(), 0);
    assert_eq!(driver.unit_count(), 0);

    let mut saw_expired = false;
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Expired { session_id, .. } = event {
            assert_eq!(session_id, view.id);
            saw_expired = true;
        }
    }
    assert!(saw_expired);
}

#[tokio::test]
async fn expired_persistent_session_stops() {
    let mut config = test_config();
    config.sessions.persistent_timeout_minutes = 0;
    let registry = registry_with(config, Arc::new(FakeDriver::new()));
    let view = registry
        .start_session(request("u1", SessionKind::PersistentTerminal, "minimal", None))
        .await
        .unwrap()
        .session;
    tokio::time::sleep(Duration::from_millis(20)).await;

    Reconciler::new(Arc::clone(&registry)).sweep_once().await;
    let status = registry.status(&view.id).await.unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert!(status.volume.is_some());
}

#[tokio::test]
async fn sweep_corrects_vanished_units() {
    let (registry, driver) = fake_registry();
    let ephemeral = registry
        .start_session(request("u1", SessionKind::EphemeralLab, "minimal", None))
        .await
        .unwrap()
        .session;
    let persistent = registry
        .start_session(request("u1", SessionKind::PersistentTerminal, "minimal", None))
        .await
        .unwrap()
        .session;
    driver.lose(&unit_name_for(&ephemeral.id));
    driver.lose(&unit_name_for(&persistent.id));

    let report = Reconciler::new(Arc::clone(&registry)).sweep_once().await;
    assert_eq!(report.lost, 2);
    assert_eq!(
        registry.status(&ephemeral.id).await.unwrap().state,
        SessionState::Failed
    );
    assert_eq!(
        registry.status(&persistent.id).await.unwrap().state,
        SessionState::Error
    );
    assert_eq!(registry.held_ports(), 0);

    // An errored persistent environment can be started again.
    let restarted = registry
        .start_session(request("u1", SessionKind::PersistentTerminal, "minimal", None))
        .await
        .unwrap();
    assert_eq!(restarted.session.id, persistent.id);
    assert_eq!(restarted.session.state, SessionState::Running);
}

#[tokio::test]
async fn sweep_removes_orphans_only() {
    let (registry, driver) = fake_registry();
    let live = registry
        .start_session(request("u1", SessionKind::EphemeralLab, "minimal", None))
        .await
        .unwrap()
        .session;
    let orphan = driver.plant_orphan("ghost");

    let report = Reconciler::new(Arc::clone(&registry)).sweep_once().await;
    assert_eq!(report.orphans, 1);
    assert_eq!(driver.stops(), vec![orphan]);
    assert!(driver.unit(&unit_name_for(&live.id)).is_some());
}

#[tokio::test]
async fn orphan_sweep_can_be_disabled() {
    let mut config = test_config();
    config.reconciler.sweep_orphans = false;
    let driver = Arc::new(FakeDriver::new());
    let registry = registry_with(config, Arc::clone(&driver));
    driver.plant_orphan("ghost");

    let report = Reconciler::new(registry).sweep_once().await;
    assert_eq!(report, SweepReport::default());
    assert_eq!(driver.unit_count(), 1);
}

#[tokio::test]
async fn ended_sessions_are_pruned_after_retention() {
    let mut config = test_config();
    config.sessions.ended_retention_minutes = 0;
    let registry = registry_with(config, Arc::new(FakeDriver::new()));
    let view = registry
        .start_session(request("u1", SessionKind::EphemeralLab, "minimal", None))
        .await
        .unwrap()
        .session;
    registry
        .stop_session(&view.id, StopReason::Requested)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = Reconciler::new(Arc::clone(&registry)).sweep_once().await;
    assert_eq!(report.pruned, 1);
    assert!(matches!(
        registry.status(&view.id).await,
        Err(LabError::NotFound(_))
    ));
    assert!(registry.commands(&view.id).is_err());
}

#[tokio::test]
async fn shutdown_stops_every_active_session() {
    let (registry, driver) = fake_registry();
    for (kind, preset) in [
        (SessionKind::EphemeralLab, "minimal"),
        (SessionKind::PersistentTerminal, "minimal"),
        (SessionKind::PersistentDesktop, "desktop"),
    ] {
        registry
            .start_session(request("u1", kind, preset, None))
            .await
            .unwrap();
    }

    let left = Reconciler::new(Arc::clone(&registry))
        .shutdown_all(Duration::from_secs(5))
        .await;
    assert_eq!(left, 0);
    assert_eq!(driver.unit_count(), 0);
    assert_eq!(registry.held_ports(), 0);
    assert!(registry.active_session_ids().is_empty());
}

#[tokio::test]
async fn spawned_reconciler_stops_on_cancel() {
    let mut config = test_config();
    config.sessions.lab_timeout_minutes = 0;
    let registry = registry_with(config, Arc::new(FakeDriver::new()));
    let view = registry
        .start_session(request("u1", SessionKind::EphemeralLab, "minimal", None))
        .await
        .unwrap()
        .session;

    let cancel = CancellationToken::new();
    let handle = Reconciler::new(Arc::clone(&registry))
        .spawn(Duration::from_millis(20), cancel.clone());

    let expired = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.status(&view.id).await.unwrap().state == SessionState::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(expired.is_ok());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Start { lab: u8, persistent: bool },
    Stop(usize),
    Lose(usize),
    Touch(usize),
    Expire,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, any::<bool>()).prop_map(|(lab, persistent)| Op::Start { lab, persistent }),
        (0usize..8).prop_map(Op::Stop),
        (0usize..8).prop_map(Op::Lose),
        (0usize..8).prop_map(Op::Touch),
        Just(Op::Expire),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn histories_follow_the_state_graph(ops in prop::collection::vec(op(), 1..16)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = test_config();
            config.sessions.max_sessions_per_user = 0;
            // Sessions are overdue from the start; only a touch pushes them out.
            config.sessions.lab_timeout_minutes = 0;
            config.sessions.persistent_timeout_minutes = 0;
            let driver = Arc::new(FakeDriver::new());
            let registry = registry_with(config, Arc::clone(&driver));
            let mut ids: Vec<(String, SessionKind)> = Vec::new();

            for op in ops {
                match op {
                    Op::Start { lab, persistent } => {
                        let kind = if persistent {
                            SessionKind::PersistentTerminal
                        } else {
                            SessionKind::EphemeralLab
                        };
                        let lab = format!("lab-{}", lab);
                        if let Ok(out) = registry
                            .start_session(request("u1", kind, "minimal", Some(&lab)))
                            .await
                            && !ids.iter().any(|(id, _)| *id == out.session.id)
                        {
                            ids.push((out.session.id, kind));
                        }
                    }
                    Op::Stop(i) if !ids.is_empty() => {
                        let (id, _) = &ids[i % ids.len()];
                        let _ = registry.stop_session(id, StopReason::Requested).await;
                    }
                    Op::Lose(i) if !ids.is_empty() => {
                        let (id, _) = &ids[i % ids.len()];
                        driver.lose(&unit_name_for(id));
                        let _ = registry.status(id).await;
                    }
                    Op::Touch(i) if !ids.is_empty() => {
                        let (id, _) = &ids[i % ids.len()];
                        let _ = registry.touch(id, Some(1));
                    }
                    Op::Expire => {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        Reconciler::new(Arc::clone(&registry)).sweep_once().await;
                    }
                    _ => {}
                }
            }

            for (id, kind) in &ids {
                let history = registry.history(id).unwrap();
                assert_eq!(history[0], SessionState::Pending);
                for pair in history.windows(2) {
                    assert!(
                        pair[0].can_transition_to(pair[1], *kind),
                        "{:?} -> {:?} is not an edge for {:?}",
                        pair[0],
                        pair[1],
                        kind
                    );
                }
                if let Some(pos) = history.iter().position(|s| s.is_terminal()) {
                    assert_eq!(pos, history.len() - 1, "terminal state was left: {:?}", history);
                }
                let view = registry.status(id).await.unwrap();
                if view.state != SessionState::Running {
                    assert!(view.ports.is_empty());
                }
            }
            let running = ids
                .iter()
                .filter(|(id, _)| registry.running_session_ids().contains(id))
                .count();
            assert_eq!(registry.held_ports(), running);
        });
    }
}
