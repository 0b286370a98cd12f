//! Terminal WebSocket.
//!
//! Binary frames carry raw terminal bytes both ways. Text frames from the
//! client are input unless they are a resize control message; text frames
//! from the server are [`TerminalServerNotice`]s.

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;

use labvisor_protocol::{TerminalClientFrame, TerminalServerNotice};

use super::error::ApiResult;
use super::state::AppState;
use crate::session::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub role: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// GET /sessions/{id}/terminal
///
/// Unknown or stopped sessions are refused with an HTTP error. The shell
/// itself is only opened once the upgrade completes.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    state.registry.check_attachable(&id, &query.role)?;
    let registry = Arc::clone(&state.registry);
    Ok(ws.on_upgrade(move |socket| handle_terminal_socket(socket, registry, id, query)))
}

async fn handle_terminal_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    session_id: String,
    query: TerminalQuery,
) {
    let (mut sender, mut receiver) = socket.split();

    let bridge = match registry.attach_terminal(&session_id, &query.role).await {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!("Terminal attach to session {} failed: {}", session_id, e);
            let notice = TerminalServerNotice::Error {
                message: e.to_string(),
            };
            let _ = send_notice(&mut sender, &notice).await;
            let _ = sender.close().await;
            return;
        }
    };
    if let (Some(cols), Some(rows)) = (query.cols, query.rows) {
        bridge.resize(cols, rows).await;
    }

    let attached = TerminalServerNotice::Attached {
        shell: bridge.shell().await.unwrap_or_default(),
        resize_supported: bridge.resize_supported().await,
    };
    if send_notice(&mut sender, &attached).await.is_err() {
        registry.detach_terminal(&session_id, &bridge).await;
        return;
    }
    info!("Terminal client connected to session {}", session_id);

    let mut output = Box::pin(bridge.read());
    loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(bytes) => {
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let closed = TerminalServerNotice::Closed {
                        reason: "shell exited".to_string(),
                    };
                    let _ = send_notice(&mut sender, &closed).await;
                    break;
                }
            },
            msg = receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => TerminalClientFrame::from_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => TerminalClientFrame::from_binary(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Terminal socket error for session {}: {}", session_id, e);
                        break;
                    }
                };
                match frame {
                    TerminalClientFrame::Input(data) => {
                        if let Err(e) = bridge.write(&data).await {
                            warn!("Terminal write for session {} failed: {}", session_id, e);
                            let notice = TerminalServerNotice::Error {
                                message: e.to_string(),
                            };
                            let _ = send_notice(&mut sender, &notice).await;
                            break;
                        }
                    }
                    TerminalClientFrame::Resize { cols, rows } => {
                        if !bridge.resize(cols, rows).await {
                            debug!("Resize to {}x{} not applied for session {}", cols, rows, session_id);
                        }
                    }
                }
            }
        }
    }

    drop(output);
    registry.detach_terminal(&session_id, &bridge).await;
    info!("Terminal client disconnected from session {}", session_id);
}

async fn send_notice<S>(sender: &mut S, notice: &TerminalServerNotice) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let Ok(json) = serde_json::to_string(notice) else {
        return Err(());
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
