//! Streaming transport over the Kubernetes exec WebSocket.
//!
//! The v4 channel protocol has no resize channel, so `resize` always reports
//! `false`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{TerminalChannel, TerminalError, TerminalResult};
use crate::backend::{CHANNEL_STATUS, CHANNEL_STDERR, CHANNEL_STDOUT, ExecSocket, stdin_frame};

pub(crate) struct StreamChannel {
    sink: SplitSink<ExecSocket, WsMessage>,
    pump: JoinHandle<()>,
    closed: bool,
}

impl StreamChannel {
    pub(crate) fn open(socket: ExecSocket, buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sink, mut source) = socket.split();
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let pump = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let data = match msg {
                    Ok(WsMessage::Binary(data)) => data,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("exec stream read error: {}", e);
                        break;
                    }
                };
                let Some((&channel, payload)) = data.split_first() else {
                    continue;
                };
                match channel {
                    CHANNEL_STDOUT | CHANNEL_STDERR => {
                        if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                            break;
                        }
                    }
                    CHANNEL_STATUS => {
                        debug!(
                            "exec stream finished: {}",
                            String::from_utf8_lossy(payload)
                        );
                        break;
                    }
                    _ => {}
                }
            }
        });

        (
            Self {
                sink,
                pump,
                closed: false,
            },
            rx,
        )
    }
}

#[async_trait]
impl TerminalChannel for StreamChannel {
    async fn write(&mut self, data: &[u8]) -> TerminalResult<()> {
        if self.closed || self.pump.is_finished() {
            return Err(TerminalError::Closed);
        }
        self.sink.send(stdin_frame(data)).await.map_err(|e| {
            debug!("exec stream write failed: {}", e);
            TerminalError::Closed
        })
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> TerminalResult<bool> {
        if self.closed {
            return Err(TerminalError::Closed);
        }
        Ok(false)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sink.close().await;
        self.pump.abort();
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
