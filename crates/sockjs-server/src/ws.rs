use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use sockjs_core::Frame;
use uuid::Uuid;

use crate::handlers::{ALREADY_OPEN_CODE, ALREADY_OPEN_REASON};
use crate::server::AppState;
use crate::session::{
    self, Session, SessionEvent, CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON,
};

/// Session-url websocket: same session contract as the HTTP fallbacks, but
/// the one connection is both receiver and sender for its whole life.
pub(crate) fn session_upgrade(ws: WebSocketUpgrade, state: AppState, session_id: String) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, session_id))
}

async fn handle_session_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    let (session, _created) = state.registry.resolve_or_create(&session_id);
    let guard = match session.attach() {
        Ok(guard) => guard,
        Err(_) => {
            // A receiver is live on this id; refuse the socket, leave it be.
            let frame = Frame::close(ALREADY_OPEN_CODE, ALREADY_OPEN_REASON);
            let _ = socket.send(WsMessage::Text(frame.render().into())).await;
            let _ = socket.close().await;
            return;
        }
    };
    if guard.just_opened() {
        session::spawn_app_task(&session, Arc::clone(&state.handler));
    }
    tracing::debug!(session_id = %session_id, "Websocket session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    if ws_tx
        .send(WsMessage::Text(Frame::Open.render().into()))
        .await
        .is_err()
    {
        session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
        return;
    }

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.as_str().is_empty() {
                            continue;
                        }
                        match decode_ws_payload(text.as_str()) {
                            Ok(payloads) => {
                                // A closed session drops the inbound silently;
                                // the pump delivers the close frame next.
                                let _ = session.receive(payloads).await;
                            }
                            Err(_) => {
                                // Broken framing kills the connection outright.
                                session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                        break;
                    }
                    Some(Ok(_)) => {} // axum answers pings itself
                }
            }
            event = guard.next_event(state.config.heartbeat_interval) => {
                let frame = match event {
                    SessionEvent::Flush(batch) => Frame::Messages(batch),
                    SessionEvent::Heartbeat => Frame::Heartbeat,
                    SessionEvent::Close { code, reason } => {
                        let frame = Frame::Close { code, reason };
                        let _ = ws_tx.send(WsMessage::Text(frame.render().into())).await;
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame { code: 1000, reason: "".into() })))
                            .await;
                        break;
                    }
                };
                if ws_tx
                    .send(WsMessage::Text(frame.render().into()))
                    .await
                    .is_err()
                {
                    session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                    break;
                }
            }
        }
    }
    tracing::debug!(session_id = %session_id, "Websocket session finished");
}

/// Websocket frames carry either a JSON array of strings or a single JSON
/// string. This is looser than the HTTP send endpoints, which take arrays only.
fn decode_ws_payload(text: &str) -> Result<Vec<String>, serde_json::Error> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum WsBatch {
        Many(Vec<String>),
        One(String),
    }
    match serde_json::from_str(text)? {
        WsBatch::Many(payloads) => Ok(payloads),
        WsBatch::One(payload) => Ok(vec![payload]),
    }
}

/// Raw `/websocket` endpoint: the session contract without SockJS framing.
/// Payloads pass through untouched in both directions.
pub(crate) async fn raw_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.config.websocket_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_raw_socket(socket, state))
}

async fn handle_raw_socket(socket: WebSocket, state: AppState) {
    // Raw sockets are anonymous: server-minted id, never in the registry.
    let session = Session::new(
        format!("raw_{}", Uuid::now_v7()),
        state.config.max_inbound_queue,
    );
    let guard = match session.attach() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    session::spawn_app_task(&session, Arc::clone(&state.handler));
    tracing::debug!(session_id = %session.id(), "Raw websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = session.receive(vec![text.to_string()]).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            event = guard.next_event(state.config.heartbeat_interval) => {
                match event {
                    SessionEvent::Flush(batch) => {
                        for payload in batch {
                            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                                session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                                return;
                            }
                        }
                    }
                    SessionEvent::Heartbeat => {
                        if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                            session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                            return;
                        }
                    }
                    SessionEvent::Close { code, reason } => {
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(session_id = %session.id(), "Raw websocket finished");
}
