//! Lifecycle event WebSocket.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub user_id: Option<String>,
}

/// GET /events
pub async fn events_ws(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.registry.events().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx, query.user_id))
}

async fn forward_events(
    socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<labvisor_protocol::LifecycleEvent>,
    user_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if user_id.as_deref().is_some_and(|u| event.user_id() != u) {
                        continue;
                    }
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize lifecycle event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event subscriber lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
