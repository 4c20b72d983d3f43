//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::GameError;
use crate::replication::Envelope;
use crate::session::{AuthorityRole, Participant, ParticipantId, SessionError};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display label; defaults to "PLAYER <id>"
    pub name: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let participant_id = state.next_participant_id();
    let label = query
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("PLAYER {}", participant_id));

    info!(participant_id = %participant_id, label = %label, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, participant_id, label, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, id: ParticipantId, label: String, state: AppState) {
    let (mut ws_sink, ws_stream) = socket.split();

    // Subscribe before taking the snapshot so no write falls between the two
    let replication_rx = state.bus.subscribe();

    let participant = match join(&state, id, &label) {
        Ok(participant) => participant,
        Err(e) => {
            error!(participant_id = %id, error = %e, "Join failed");
            // A join can fail after registering; make sure nothing is left behind
            leave(&state, id);
            let _ = send_msg(&mut ws_sink, &ServerMsg::error("join_failed", e.to_string())).await;
            return;
        }
    };

    let welcome = ServerMsg::Welcome {
        participant_id: id,
        role: participant.role,
        server_time: unix_millis(),
        snapshot: state.bus.snapshot(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(participant_id = %id, error = %e, "Failed to send welcome");
        leave(&state, id);
        return;
    }

    run_session(id, &state, ws_sink, ws_stream, replication_rx).await;

    // Cleanup on disconnect
    leave(&state, id);

    info!(participant_id = %id, "WebSocket connection closed");
}

/// The first connection without a registered host becomes the host
fn join(state: &AppState, id: ParticipantId, label: &str) -> Result<Participant, GameError> {
    if state.sessions.host().is_none() {
        match state
            .orchestrator
            .on_participant_joined(id, label, AuthorityRole::Host)
        {
            // Lost the race to another connection; join as a remote instead
            Err(GameError::Session(SessionError::HostAlreadyPresent { .. })) => {}
            other => return other,
        }
    }
    state
        .orchestrator
        .on_participant_joined(id, label, AuthorityRole::Remote)
}

fn leave(state: &AppState, id: ParticipantId) {
    if let Err(e) = state.orchestrator.on_participant_left(id) {
        error!(participant_id = %id, error = %e, "Failed to remove participant");
    }
}

/// Run the WebSocket session with read/write split
async fn run_session(
    id: ParticipantId,
    state: &AppState,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut replication_rx: broadcast::Receiver<Envelope>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMsg>(32);

    // Spawn writer task: replication stream and direct replies -> WebSocket
    let writer_bus = state.bus.clone();
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
                result = replication_rx.recv() => match result {
                    Ok(envelope) if envelope.addressed_to(id) => ServerMsg::Replication { envelope },
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(participant_id = %id, lagged_count = n, "Client lagged, resending snapshot");
                        // Versions let the client discard anything it already has
                        let mut failed = false;
                        for envelope in writer_bus.snapshot() {
                            if let Err(e) = send_msg(&mut ws_sink, &ServerMsg::Replication { envelope }).await {
                                debug!(participant_id = %id, error = %e, "WebSocket send failed");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(participant_id = %id, "Replication channel closed");
                        break;
                    }
                },
            };

            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(participant_id = %id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> arena
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(participant_id = %id, error = %e, "Failed to parse client message");
                        continue;
                    }
                };

                match client_msg {
                    ClientMsg::Drive { throttle, turn } => {
                        if !rate_limiter.check_input() {
                            warn!(participant_id = %id, "Rate limited input message");
                            continue;
                        }
                        let result = state.arena.lock().drive(id, throttle, turn);
                        if let Err(e) = result {
                            debug!(participant_id = %id, error = %e, "Drive ignored");
                        }
                    }
                    ClientMsg::Fire { launch_force } => {
                        if !rate_limiter.check_fire() {
                            let _ = reply_tx
                                .send(ServerMsg::error("rate_limited", "Firing too fast"))
                                .await;
                            continue;
                        }
                        let result = state.arena.lock().fire(id, launch_force);
                        if let Err(e) = result {
                            let _ = reply_tx
                                .send(ServerMsg::error("fire_rejected", e.to_string()))
                                .await;
                        }
                    }
                    ClientMsg::Ready { ready } => {
                        if !rate_limiter.check_input() {
                            continue;
                        }
                        if let Err(e) = state.sessions.set_ready(id, ready) {
                            let _ = reply_tx
                                .send(ServerMsg::error("ready_rejected", e.to_string()))
                                .await;
                        }
                    }
                    ClientMsg::Ping { t } => {
                        if !rate_limiter.check_input() {
                            continue;
                        }
                        let _ = reply_tx
                            .send(ServerMsg::Pong {
                                t,
                                server_time: unix_millis(),
                            })
                            .await;
                    }
                    ClientMsg::Leave => {
                        info!(participant_id = %id, "Client left");
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(participant_id = %id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                debug!(participant_id = %id, "Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!(participant_id = %id, "Received pong");
            }
            Ok(Message::Close(_)) => {
                info!(participant_id = %id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(participant_id = %id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Abort writer task
    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
