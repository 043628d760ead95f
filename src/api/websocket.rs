use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use crate::hub::new_hub_feed_client;

use super::state::AppState;

/// Local feed endpoint: every subscriber gets the cached pending actions,
/// then each live frame as a text message, with keepalive pings.
pub async fn client_feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.agent_service.feed_hub().is_running() {
        error!("failed to connect feed client, hub not running");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.agent_service.feed_hub();
    let ping_period = Duration::from_secs(state.config.websocket.ping_period_sec);

    let (client, mut rx) = new_hub_feed_client(false);
    let client_id = client.id;

    let (mut sender, mut receiver) = socket.split();

    // writer: forwards hub frames and keeps the connection alive. It owns
    // the delivery receiver, so aborting it also unblocks the hub if the
    // fan-out was stalled on this subscriber.
    let write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        let text = String::from_utf8_lossy(&frame).into_owned();
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // hub closed the channel; close the peer connection
                        debug!("client feed channel was closed");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // the writer drains the channel before registration, so the cached
    // replay cannot stall the hub
    hub.register_client(client).await;
    info!("new local feed client connected");

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    // peer is gone: drop the receiver first, then unregister
    write_task.abort();
    hub.unregister_client(client_id).await;
    info!("local feed client disconnected");
}
