//! Lifecycle reconciler.
//!
//! A periodic sweep that expires sessions past their deadline, corrects
//! records whose unit vanished behind our back, removes labelled units no
//! session owns, and forgets ended sessions after the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labvisor_protocol::SessionState;

use crate::session::{SessionRegistry, StopReason};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub lost: usize,
    pub orphans: usize,
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    registry: Arc<SessionRegistry>,
}

impl Reconciler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Run one pass. Individual failures are logged and skipped.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for id in self.registry.expired_session_ids(now) {
            match self.registry.stop_session(&id, StopReason::Expired).await {
                Ok(view) if view.state.is_terminal() || view.state == SessionState::Stopped => {
                    report.expired += 1;
                }
                Ok(view) => debug!("Expired session {} left in {}", id, view.state),
                Err(e) => warn!("Failed to expire session {}: {}", id, e),
            }
        }

        for id in self.registry.running_session_ids() {
            match self.registry.status(&id).await {
                Ok(view) if view.state != SessionState::Running => report.lost += 1,
                Ok(_) => {}
                Err(e) => debug!("Status audit for session {} failed: {}", id, e),
            }
        }

        if self.registry.config().reconciler.sweep_orphans {
            report.orphans = self.sweep_orphans().await;
        }

        let retention =
            ChronoDuration::minutes(self.registry.config().sessions.ended_retention_minutes as i64);
        report.pruned = self.registry.prune_ended(now - retention);

        if !report.is_empty() {
            info!(
                "Reconciler: {} expired, {} lost, {} orphaned, {} pruned",
                report.expired, report.lost, report.orphans, report.pruned
            );
        }
        report
    }

    /// Stop labelled units whose session is not active here, e.g. left over
    /// from a previous process.
    async fn sweep_orphans(&self) -> usize {
        let grace = self.registry.config().sessions.stop_grace();
        let limit = self.registry.config().sessions.stop_timeout();
        let mut removed = 0;

        for driver in self.registry.drivers().all() {
            let owned = match driver.list_owned().await {
                Ok(owned) => owned,
                Err(e) => {
                    debug!("Listing {} units failed: {}", driver.kind(), e);
                    continue;
                }
            };
            for unit in owned {
                if self.registry.is_active(&unit.session_id) {
                    continue;
                }
                info!(
                    "Removing orphaned {} {} (session {})",
                    driver.kind(),
                    unit.handle.name,
                    unit.session_id
                );
                match tokio::time::timeout(limit, driver.stop(&unit.handle, grace)).await {
                    Ok(Ok(())) => removed += 1,
                    Ok(Err(e)) => warn!("Failed to remove orphan {}: {}", unit.handle.name, e),
                    Err(_) => warn!("Removing orphan {} timed out", unit.handle.name),
                }
            }
        }
        removed
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` until `cancel`
    /// fires.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting lifecycle reconciler (every {}s)",
            interval.as_secs()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }

    /// Stop every active session, bounded by `timeout`. Returns how many
    /// sessions were still live when the deadline passed.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        let ids = self.registry.active_session_ids();
        if ids.is_empty() {
            return 0;
        }
        info!("Stopping {} active session(s)", ids.len());

        let stops = ids.iter().map(|id| async move {
            if let Err(e) = self.registry.stop_session(id, StopReason::Shutdown).await {
                warn!("Failed to stop session {} on shutdown: {}", id, e);
            }
        });
        if tokio::time::timeout(timeout, join_all(stops)).await.is_err() {
            warn!(
                "Shutdown did not finish within {}s",
                timeout.as_secs()
            );
        }

        let left = self.registry.active_session_ids();
        for id in &left {
            warn!("Session {} abandoned at shutdown", id);
        }
        left.len()
    }
}
