//! Subprocess transport: the attach command runs on a local PTY pair.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

use super::{TerminalChannel, TerminalError, TerminalResult};

const READ_CHUNK: usize = 4096;

pub(crate) struct PtyChannel {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    closed: bool,
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyChannel {
    /// Spawn `program args` on a fresh PTY. Output arrives on the returned
    /// receiver; at most `buffer` chunks are queued before the reader thread
    /// blocks.
    pub(crate) fn spawn(
        program: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        buffer: usize,
    ) -> TerminalResult<(Self, mpsc::Receiver<Bytes>)> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn(format!("{}: {}", program, e)))?;
        // The reader sees EOF only once every slave descriptor is closed.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let label = program.to_string();
        std::thread::Builder::new()
            .name("labvisor-pty".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        // EIO once the child side hangs up.
                        Err(_) => break,
                    }
                }
                match child.wait() {
                    Ok(status) => debug!("{} exited with {}", label, status.exit_code()),
                    Err(e) => warn!("failed to reap {}: {}", label, e),
                }
            })?;

        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                killer,
                closed: false,
            },
            rx,
        ))
    }
}

#[async_trait]
impl TerminalChannel for PtyChannel {
    async fn write(&mut self, data: &[u8]) -> TerminalResult<()> {
        if self.closed {
            return Err(TerminalError::Closed);
        }
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> TerminalResult<()> {
            let mut writer = writer.lock().map_err(|_| TerminalError::Closed)?;
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|_| TerminalError::Closed)?
    }

    fn resize(&mut self, cols: u16, rows: u16) -> TerminalResult<bool> {
        if self.closed {
            return Err(TerminalError::Closed);
        }
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| TerminalError::Io(std::io::Error::other(e.to_string())))?;
        Ok(true)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.killer.kill() {
            debug!("pty child already gone: {}", e);
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.killer.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_until(rx: &mut mpsc::Receiver<Bytes>, needle: &str) -> String {
        let mut seen = String::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = rx.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    break;
                }
            }
        })
        .await;
        seen
    }

    #[tokio::test]
    async fn shell_echo_round_trip() {
        let (mut chan, mut rx) = PtyChannel::spawn("/bin/sh", &[], 80, 24, 16).unwrap();
        chan.write(b"echo lab-$((40 + 2))\n").await.unwrap();
        let out = read_until(&mut rx, "lab-42").await;
        assert!(out.contains("lab-42"), "output was {out:?}");
        assert!(chan.resize(100, 30).unwrap());
        chan.close().await;
        chan.close().await;
        assert!(matches!(chan.write(b"x").await, Err(TerminalError::Closed)));
    }

    #[tokio::test]
    async fn output_ends_when_process_exits() {
        let args = vec!["-c".to_string(), "echo bye".to_string()];
        let (_chan, mut rx) = PtyChannel::spawn("/bin/sh", &args, 80, 24, 16).unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            let mut all = Vec::new();
            while let Some(chunk) = rx.recv().await {
                all.extend_from_slice(&chunk);
            }
            all
        })
        .await
        .expect("stream should end after exit");
        assert!(String::from_utf8_lossy(&drained).contains("bye"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = PtyChannel::spawn("/no/such/shell", &[], 80, 24, 4).err().unwrap();
        assert!(matches!(err, TerminalError::Spawn(_)));
    }
}
