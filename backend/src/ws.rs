//! `GET /ws`: pushes change notifications for the caller's bargains.
//!
//! Each frame is a JSON `{bargainId, changeKind}`. Clients re-fetch
//! `GET /bargains/:id` on receipt; frames never carry bargain state. A
//! client that falls behind gets `{"resync": true}` and should reload its list.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Extension;
use futures::{SinkExt, StreamExt};
use serde_json::json;

use crate::bus::{Delivery, Topic};
use crate::handlers::AppState;
use crate::models::{Actor, Party};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor))
}

pub fn topic_for(actor: &Actor) -> Topic {
    match actor.party {
        Party::Vendor => Topic::Vendor(actor.user_id),
        Party::Supplier => Topic::Supplier(actor.user_id),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, actor: Actor) {
    log::debug!("WebSocket connected for {} {}", actor.party, actor.user_id);
    let (subscription, mut changes) = state.service.bus().subscribe_channel(topic_for(&actor));
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(delivery) = changes.recv().await {
            let frame = match delivery {
                Delivery::Change(notification) => serde_json::to_string(&notification),
                Delivery::Resync => serde_json::to_string(&json!({"resync": true})),
            };
            match frame {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Failed to serialize notification: {}", e),
            }
        }
    });

    // Inbound frames are ignored; we only watch for the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::warn!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    drop(subscription);
    log::debug!("WebSocket closed for {} {}", actor.party, actor.user_id);
}
