//! Bounded readiness polling shared by every driver.

use std::time::Duration;

use log::debug;

use super::{BackendDriver, BackendError, BackendResult, ResourceHandle, UnitStatus};

/// Poll `driver.is_ready` every `interval` until it reports ready or `timeout`
/// elapses.
///
/// A unit that reports `Stopped` while we wait has exited and fails fast.
/// Transient errors are retried until the deadline.
pub async fn wait_until_ready(
    driver: &dyn BackendDriver,
    handle: &ResourceHandle,
    interval: Duration,
    timeout: Duration,
) -> BackendResult<()> {
    let start = tokio::time::Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        match driver.is_ready(handle).await {
            Ok(true) => {
                debug!(
                    "{} {} ready after {} attempts",
                    driver.kind(),
                    handle.name,
                    attempts
                );
                return Ok(());
            }
            Ok(false) => {
                if driver.status(handle).await? == UnitStatus::Stopped {
                    return Err(BackendError::CommandFailed {
                        command: "readiness".to_string(),
                        message: format!("{} exited before becoming ready", handle.name),
                    });
                }
            }
            Err(err) if err.is_not_found() => {
                return Err(err);
            }
            Err(err) => {
                debug!(
                    "readiness probe for {} failed (attempt {}): {}",
                    handle.name, attempts, err
                );
            }
        }

        if start.elapsed() >= timeout {
            return Err(BackendError::Timeout(timeout));
        }

        tokio::time::sleep(interval).await;
    }
}
