use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use wm_core::events::Event;
use wm_infra::types::Channels;

use crate::state::AppState;

/// GET /channels/{channel}/ws
///
/// Streams the bus events published on a machine channel: output lines
/// of an output channel, status transitions of a status channel.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let events = state.manager.bus().subscribe();
    ws.on_upgrade(move |socket| relay(socket, channel, events))
}

fn on_channel(event: &Event, channel: &str) -> bool {
    match event {
        Event::Output(line) => line.channel == channel,
        Event::MachineStatus(status) => {
            Channels::status_channel(&status.workspace_id, &status.machine_name) == channel
        }
        _ => false,
    }
}

async fn relay(
    socket: WebSocket,
    channel: String,
    mut events: tokio::sync::broadcast::Receiver<Event>,
) {
    let (mut client_write, mut client_read) = socket.split();
    tracing::debug!(channel, "channel subscriber connected");

    let writer = async {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel, skipped, "channel subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !on_channel(&event, &channel) {
                continue;
            }

            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if client_write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    // Inbound frames are ignored; the loop only watches for the close.
    let reader = async {
        while let Some(Ok(msg)) = client_read.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    tracing::debug!(channel, "channel subscriber disconnected");
}
