//! Flowcraft signaling relay
//!
//! Rendezvous point for collaboration rooms. Clients join a topic, and every
//! document update or presence message they send is relayed to the other
//! connections in that topic. The relay never stores document state: a
//! newcomer catches up from the snapshots its peers send when they see it
//! join.
//!
//! ## Protocol
//!
//! Messages are JSON objects tagged by `type`:
//! ```json
//! { "type": "join", "room": "flowcraft-<id>", "password": "optional", "max_peers": 20 }
//! { "type": "sync", "data": "<base64-encoded-loro-bytes>" }
//! { "type": "awareness", "update": { "type": "update", "clock": 3, "record": { ... } } }
//! { "type": "leave" }
//! ```
//!
//! A connection whose room channel lags behind loses relayed messages. The
//! relay then sends `resync` to the rest of the room, and every peer answers
//! with a full snapshot.

mod config;
mod protocol;
mod rooms;

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use config::SignalConfig;
use protocol::{ClientMessage, ServerMessage};
use rooms::{AppState, Relayed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowcraft_signal=info,tower_http=info".into()),
        )
        .init();

    let config = SignalConfig::from_env()?;
    let state = Arc::new(AppState::new(config.max_room_peers));

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(
        "Flowcraft signaling relay listening on {} (max {} peers per room)",
        config.addr, config.max_room_peers
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index() -> &'static str {
    "Flowcraft signaling relay - connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serialize and send one message. Returns false once the socket is gone.
async fn send<S>(sender: &mut S, msg: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode server message: {}", e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New connection: {}", conn_id);

    let (mut sender, mut receiver) = socket.split();
    let mut current_room: Option<String> = None;
    let mut room_rx: Option<broadcast::Receiver<Relayed>> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame from {}", conn_id);
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn_id, e);
                        break;
                    }
                };

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", conn_id, e);
                        let err = ServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        };
                        if !send(&mut sender, &err).await {
                            break;
                        }
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Join { room, password, max_peers } => {
                        if let Some(old_room) = current_room.take() {
                            state.leave_room(&old_room, &conn_id);
                            room_rx = None;
                        }

                        match state.join_room(&room, &conn_id, password, max_peers) {
                            Ok((rx, peer_count)) => {
                                room_rx = Some(rx);
                                current_room = Some(room.clone());
                                let joined = ServerMessage::Joined {
                                    room: room.clone(),
                                    peer_count,
                                };
                                if !send(&mut sender, &joined).await {
                                    break;
                                }
                                state.broadcast(&room, &conn_id, ServerMessage::PeerJoined {
                                    peer_id: conn_id.clone(),
                                });
                                info!("Connection {} joined {} ({} peers)", conn_id, room, peer_count);
                            }
                            Err(e) => {
                                info!("Connection {} refused by {}: {}", conn_id, room, e);
                                let err = ServerMessage::Error { message: e.to_string() };
                                if !send(&mut sender, &err).await {
                                    break;
                                }
                            }
                        }
                    }
                    ClientMessage::Leave => {
                        if let Some(room) = current_room.take() {
                            state.leave_room(&room, &conn_id);
                            info!("Connection {} left {}", conn_id, room);
                        }
                        room_rx = None;
                    }
                    ClientMessage::Sync { data } => {
                        if let Some(ref room) = current_room {
                            state.broadcast(room, &conn_id, ServerMessage::Sync {
                                from: conn_id.clone(),
                                data,
                            });
                        }
                    }
                    ClientMessage::Awareness { update } => {
                        if let Some(ref room) = current_room {
                            state.broadcast(room, &conn_id, ServerMessage::Awareness {
                                from: conn_id.clone(),
                                update,
                            });
                        }
                    }
                }
            }

            relayed = async {
                match &mut room_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match relayed {
                    Ok((from, server_msg)) => {
                        // Don't echo back to the sender
                        if from != conn_id && !send(&mut sender, &server_msg).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection {} lagged, skipped {} messages", conn_id, skipped);
                        if let Some(ref room) = current_room {
                            state.request_resync(room, &conn_id);
                        }
                    }
                    Err(RecvError::Closed) => room_rx = None,
                }
            }
        }
    }

    if let Some(ref room) = current_room {
        state.leave_room(room, &conn_id);
    }
    info!("Connection closed: {}", conn_id);
}
