pub mod handler;

use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ChatError,
};
use crate::metrics;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use handler::Connection;
use parley_common::protocol::{
    error::ErrorKind,
    ws::{decode_client_event, encode_server_event, ClientEvent, ServerEvent},
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 35_000;
const HELLO_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 262_144;
const MAX_QUEUED_EVENTS: usize = 64;

pub fn router(state: AppState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, socket)).await;
    })
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let hello_started_at = Instant::now();
    let user_id = match handshake(&state, &mut socket).await {
        Ok(user_id) => user_id,
        Err(Some(error)) => {
            metrics::record_ws_request("hello", true, hello_started_at.elapsed().as_millis() as u64);
            warn!(request_id = %request_id, kind = %error.kind(), "websocket handshake rejected");
            let _ = send_event(&mut socket, &error.to_event()).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(None) => {
            metrics::record_ws_request("hello", true, hello_started_at.elapsed().as_millis() as u64);
            return;
        }
    };

    let hello_ack = ServerEvent::HelloAck { user_id, server_time: Utc::now().to_rfc3339() };
    if send_event(&mut socket, &hello_ack).await.is_err() {
        metrics::record_ws_request("hello", true, hello_started_at.elapsed().as_millis() as u64);
        return;
    }
    metrics::record_ws_request("hello", false, hello_started_at.elapsed().as_millis() as u64);

    let connection = Connection { id: Uuid::new_v4(), user_id };
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    state.hub.register(connection.id, outbound_sender);
    state.membership.attach(user_id, connection.id);
    metrics::adjust_active_connections(1);
    info!(request_id = %request_id, user_id = %user_id, connection_id = %connection.id, "connection established");

    // Server pings every HEARTBEAT_INTERVAL_MS and gives up once no pong has
    // arrived for HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    // One event is handled at a time. The socket keeps being read while it
    // runs, so a close drops the in-flight handler instead of waiting for it.
    let start = |event: ClientEvent| handler::dispatch(&state, &connection, event).boxed();
    let mut in_flight: Option<BoxFuture<'_, Option<ServerEvent>>> = None;
    let mut queued: VecDeque<ClientEvent> = VecDeque::new();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(connection_id = %connection.id, request_id = %request_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            reply = async {
                match in_flight.as_mut() {
                    Some(handling) => handling.await,
                    None => std::future::pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = queued.pop_front().map(start);
                if let Some(reply) = reply {
                    if send_event(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
            // Held back while an event is in flight so its reply goes out first.
            maybe_outbound = outbound_receiver.recv(), if in_flight.is_none() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let rejection = match decode_client_event(&raw_message) {
                            Ok(event) if in_flight.is_none() => {
                                in_flight = Some(start(event));
                                None
                            }
                            Ok(_) if queued.len() >= MAX_QUEUED_EVENTS => {
                                Some(ServerEvent::error(ErrorKind::ValidationFailed, "too many events in flight"))
                            }
                            Ok(event) => {
                                queued.push_back(event);
                                None
                            }
                            Err(error) => Some(ServerEvent::error(ErrorKind::ValidationFailed, error.to_string())),
                        };
                        if let Some(rejection) = rejection {
                            if send_event(&mut socket, &rejection).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        let reply = ServerEvent::error(ErrorKind::ValidationFailed, "binary frames are not supported");
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                }
            }
        }
    }

    let abandoned = in_flight.is_some();
    drop(in_flight);
    if abandoned {
        info!(request_id = %request_id, connection_id = %connection.id, "in-flight event abandoned on disconnect");
    }

    state.hub.deregister(connection.id);
    let last_connection = state.membership.detach(user_id, connection.id);
    metrics::adjust_active_connections(-1);
    info!(
        request_id = %request_id,
        user_id = %user_id,
        connection_id = %connection.id,
        last_connection,
        "connection closed"
    );
}

/// Wait for the `HELLO` frame and authenticate it. `Err(None)` means the
/// peer went away before saying anything.
async fn handshake(state: &AppState, socket: &mut WebSocket) -> Result<Uuid, Option<ChatError>> {
    let first = match tokio::time::timeout(Duration::from_millis(HELLO_TIMEOUT_MS), socket.recv()).await {
        Ok(Some(Ok(Message::Text(raw_message)))) => raw_message,
        Ok(Some(Ok(_))) => {
            return Err(Some(ChatError::new(ErrorKind::Unauthorized, "first frame must be a HELLO event")));
        }
        Ok(_) => return Err(None),
        Err(_) => return Err(Some(ChatError::new(ErrorKind::Unauthorized, "HELLO was not received in time"))),
    };

    let Ok(ClientEvent::Hello { access_token, session_id }) = decode_client_event(&first) else {
        return Err(Some(ChatError::new(ErrorKind::Unauthorized, "first frame must be a HELLO event")));
    };

    let user_id = state
        .jwt
        .validate_access_token(&access_token)
        .map_err(|_| Some(ChatError::new(ErrorKind::Unauthorized, "invalid access token")))?;

    let session = state
        .sessions
        .validate_session(user_id, &session_id)
        .await
        .and_then(|validation| validation.into_result())
        .map_err(Some)?;

    Ok(session.user_id)
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
