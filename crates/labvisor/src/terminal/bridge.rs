use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use futures::stream;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::pty::PtyChannel;
use super::stream::StreamChannel;
use super::{TerminalChannel, TerminalError, TerminalResult};
use crate::backend::{AttachTarget, BackendDriver, ResourceHandle};
use crate::config::TerminalConfig;

/// Observer of raw input bytes (the objective verifier).
pub trait InputTap: Send + Sync {
    fn record_input(&self, session_id: &str, data: &[u8]);
}

struct Attached {
    channel: Box<dyn TerminalChannel>,
    shell: String,
    resize_supported: bool,
}

/// Output receiver shared between `read` calls. The generation guards
/// against a stale reader putting back the receiver of a previous attach.
#[derive(Default)]
struct OutputSlot {
    generation: u64,
    rx: Option<mpsc::Receiver<Bytes>>,
}

struct ReaderLease {
    slot: Arc<Mutex<OutputSlot>>,
    generation: u64,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        if let Ok(mut slot) = self.slot.lock()
            && slot.generation == self.generation
            && slot.rx.is_none()
        {
            slot.rx = Some(rx);
        }
    }
}

/// Interactive shell inside one running unit.
pub struct TerminalBridge {
    session_id: String,
    driver: Arc<dyn BackendDriver>,
    handle: ResourceHandle,
    config: TerminalConfig,
    tap: Option<Arc<dyn InputTap>>,
    attached: tokio::sync::Mutex<Option<Attached>>,
    output: Arc<Mutex<OutputSlot>>,
    last_error: Mutex<Option<String>>,
}

impl TerminalBridge {
    pub fn new(
        session_id: impl Into<String>,
        driver: Arc<dyn BackendDriver>,
        handle: ResourceHandle,
        config: TerminalConfig,
        tap: Option<Arc<dyn InputTap>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            driver,
            handle,
            config,
            tap,
            attached: tokio::sync::Mutex::new(None),
            output: Arc::new(Mutex::new(OutputSlot::default())),
            last_error: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Open the shell. Returns `false` on failure; the cause is kept in
    /// [`last_error`](Self::last_error). A running bridge returns `true`.
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => {
                self.set_last_error(None);
                true
            }
            Err(e) => {
                warn!("Terminal attach for session {} failed: {}", self.session_id, e);
                self.set_last_error(Some(e.to_string()));
                false
            }
        }
    }

    async fn try_start(&self) -> TerminalResult<()> {
        let mut attached = self.attached.lock().await;
        if attached.is_some() {
            return Ok(());
        }

        let shell = self.detect_shell().await?;
        let target = self.driver.attach_target(&self.handle, &shell);
        let (channel, rx, resize_supported) = match target {
            AttachTarget::Command { ref program, ref args } => {
                let (chan, rx) = PtyChannel::spawn(
                    program,
                    args,
                    self.config.cols,
                    self.config.rows,
                    self.config.output_buffer,
                )?;
                (Box::new(chan) as Box<dyn TerminalChannel>, rx, true)
            }
            AttachTarget::PodExec { .. } => {
                let exec = self
                    .driver
                    .open_exec_stream(&target)
                    .await
                    .map_err(|e| TerminalError::Connect(e.to_string()))?;
                let (chan, rx) = StreamChannel::open(exec.into_socket(), self.config.output_buffer);
                (Box::new(chan) as Box<dyn TerminalChannel>, rx, false)
            }
        };

        if let Ok(mut slot) = self.output.lock() {
            slot.generation += 1;
            slot.rx = Some(rx);
        }
        info!(
            "Terminal attached to session {} using {} (resize {})",
            self.session_id,
            shell,
            if resize_supported { "supported" } else { "unsupported" }
        );
        *attached = Some(Attached {
            channel,
            shell,
            resize_supported,
        });
        Ok(())
    }

    /// First candidate shell that is executable inside the unit.
    async fn detect_shell(&self) -> TerminalResult<String> {
        for shell in &self.config.shell_candidates {
            let probe = ["test".to_string(), "-x".to_string(), shell.clone()];
            match self.driver.exec(&self.handle, &probe).await {
                Ok(out) if out.success() => return Ok(shell.clone()),
                Ok(_) => debug!("{} not available in session {}", shell, self.session_id),
                Err(e) => {
                    debug!("Shell probe for {} failed: {}", shell, e);
                    if e.is_not_found() {
                        break;
                    }
                }
            }
        }
        Err(TerminalError::NoShell)
    }

    /// Forward input to the remote shell and to the input tap.
    pub async fn write(&self, data: &[u8]) -> TerminalResult<()> {
        let mut attached = self.attached.lock().await;
        let Some(att) = attached.as_mut() else {
            return Err(TerminalError::Closed);
        };
        att.channel.write(data).await?;
        if let Some(ref tap) = self.tap {
            tap.record_input(&self.session_id, data);
        }
        Ok(())
    }

    /// Stream of remote output.
    ///
    /// Each call takes over the output; while one stream is alive further
    /// calls yield an empty stream. Dropping the stream hands the output back
    /// for the next call. The stream ends when the shell exits or the bridge
    /// is stopped.
    pub fn read(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        let (generation, rx) = match self.output.lock() {
            Ok(mut slot) => (slot.generation, slot.rx.take()),
            Err(_) => (0, None),
        };
        let lease = ReaderLease {
            slot: Arc::clone(&self.output),
            generation,
            rx,
        };
        stream::unfold(lease, |mut lease| async move {
            let chunk = lease.rx.as_mut()?.recv().await?;
            Some((chunk, lease))
        })
    }

    /// Best-effort geometry change. `false` when the transport cannot
    /// resize or the bridge is not running.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        let mut attached = self.attached.lock().await;
        match attached.as_mut() {
            Some(att) => match att.channel.resize(cols, rows) {
                Ok(applied) => applied,
                Err(e) => {
                    debug!("Resize failed for session {}: {}", self.session_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Close the shell and drop any buffered output. Idempotent.
    pub async fn stop(&self) {
        let taken = self.attached.lock().await.take();
        if let Ok(mut slot) = self.output.lock() {
            slot.generation += 1;
            slot.rx = None;
        }
        if let Some(mut att) = taken {
            att.channel.close().await;
            debug!("Terminal for session {} stopped", self.session_id);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.attached.lock().await.is_some()
    }

    pub async fn shell(&self) -> Option<String> {
        self.attached.lock().await.as_ref().map(|a| a.shell.clone())
    }

    pub async fn resize_supported(&self) -> bool {
        self.attached
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| a.resize_supported)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = error;
        }
    }
}
