use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use sockjs_core::{Frame, SessionError, Transport};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::server::AppState;
use crate::session::{self, ReceiverGuard, SessionEvent};
use crate::ws;

/// Close frame sent in place of a normal response body when a second
/// receiver shows up while one is attached.
pub(crate) const ALREADY_OPEN_CODE: u16 = 2010;
pub(crate) const ALREADY_OPEN_REASON: &str = "Another connection still open";

const NO_CACHE: &str = "no-store, no-cache, no-transform, must-revalidate, max-age=0";
const CACHE_ONE_YEAR: &str = "public, max-age=31536000";

/// GET on a session url: the transports whose receiving side opens with a GET.
pub(crate) async fn session_get(
    State(state): State<AppState>,
    Path((server, session_id, transport)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !valid_session_segments(&server, &session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match transport.as_str() {
        "websocket" => match ws {
            Ok(upgrade) if state.config.websocket_enabled => {
                ws::session_upgrade(upgrade, state, session_id)
            }
            Ok(_) => StatusCode::NOT_FOUND.into_response(),
            Err(_) => (StatusCode::BAD_REQUEST, "Not a websocket handshake").into_response(),
        },
        "eventsource" => connect(state, session_id, Transport::EventSource, String::new()).await,
        "htmlfile" | "jsonp" => {
            let kind = if transport == "htmlfile" {
                Transport::HtmlFile
            } else {
                Transport::Jsonp
            };
            match callback_param(&params) {
                Some(callback) => connect(state, session_id, kind, callback).await,
                None => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "\"callback\" parameter required")
                        .into_response()
                }
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST on a session url: xhr connects and the send-class requests.
pub(crate) async fn session_post(
    State(state): State<AppState>,
    Path((server, session_id, transport)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !valid_session_segments(&server, &session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match transport.as_str() {
        "xhr" => connect(state, session_id, Transport::XhrPolling, String::new()).await,
        "xhr_streaming" => {
            connect(state, session_id, Transport::XhrStreaming, String::new()).await
        }
        "xhr_send" => send_class(state, session_id, decode_payload(&body), SendAck::NoContent).await,
        "jsonp_send" => {
            send_class(
                state,
                session_id,
                jsonp_send_payload(&headers, &body),
                SendAck::Ok,
            )
            .await
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// OPTIONS on session urls. CORS negotiation itself lives in the CorsLayer;
/// this only supplies the cacheable no-content answer.
pub(crate) async fn session_options() -> Response {
    (
        StatusCode::NO_CONTENT,
        [(header::CACHE_CONTROL, CACHE_ONE_YEAR)],
    )
        .into_response()
}

/// Resolve-or-create plus receiver attach, shared by every HTTP connect
/// transport. The websocket path has its own version in `ws`.
async fn connect(
    state: AppState,
    session_id: String,
    transport: Transport,
    callback: String,
) -> Response {
    let (session, _created) = state.registry.resolve_or_create(&session_id);
    let guard = match session.attach() {
        Ok(guard) => guard,
        Err(err) => {
            tracing::debug!(session_id = %session_id, kind = err.kind(), "Connect refused");
            return already_open_response(transport, &callback);
        }
    };
    if guard.just_opened() {
        session::spawn_app_task(&session, Arc::clone(&state.handler));
    }
    if transport.is_streaming() {
        streaming_response(state, guard, transport, callback)
    } else {
        one_shot_response(state, guard, transport, callback).await
    }
}

/// The benign "connection still open" answer: a close frame, not an error.
/// The existing receiver is untouched.
fn already_open_response(transport: Transport, callback: &str) -> Response {
    let frame = Frame::close(ALREADY_OPEN_CODE, ALREADY_OPEN_REASON);
    let mut body = Vec::new();
    if let Some(prelude) = transport.prelude(callback) {
        body.extend_from_slice(&prelude);
    }
    body.extend_from_slice(&transport.encode(&frame, callback));
    framed_response(transport, Bytes::from(body))
}

/// One frame per response. A connect with nothing queued long-polls: it
/// waits for a message or close, and answers with a heartbeat frame when
/// the heartbeat interval elapses first.
async fn one_shot_response(
    state: AppState,
    guard: ReceiverGuard,
    transport: Transport,
    callback: String,
) -> Response {
    let frame = if guard.just_opened() {
        Frame::Open
    } else {
        match guard.next_event(state.config.heartbeat_interval).await {
            SessionEvent::Flush(batch) => Frame::Messages(batch),
            SessionEvent::Heartbeat => Frame::Heartbeat,
            SessionEvent::Close { code, reason } => Frame::Close { code, reason },
        }
    };
    framed_response(transport, transport.encode(&frame, &callback))
}

/// Long-lived response: prelude, then frames as they arrive, until close or
/// the response byte cap forces a rotation. The receiver guard lives in the
/// pump task, so a dropped body (client gone) detaches on the next write.
fn streaming_response(
    state: AppState,
    guard: ReceiverGuard,
    transport: Transport,
    callback: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(8);
    let config = Arc::clone(&state.config);
    tokio::spawn(async move {
        if let Some(prelude) = transport.prelude(&callback) {
            if tx.send(Ok(prelude)).await.is_err() {
                return;
            }
        }
        if guard.just_opened() {
            let open = transport.encode(&Frame::Open, &callback);
            if tx.send(Ok(open)).await.is_err() {
                return;
            }
        }
        let mut sent = 0usize;
        loop {
            let frame = match guard.next_event(config.heartbeat_interval).await {
                SessionEvent::Flush(batch) => Frame::Messages(batch),
                SessionEvent::Heartbeat => Frame::Heartbeat,
                SessionEvent::Close { code, reason } => {
                    let bytes = transport.encode(&Frame::Close { code, reason }, &callback);
                    let _ = tx.send(Ok(bytes)).await;
                    return;
                }
            };
            let bytes = transport.encode(&frame, &callback);
            sent += bytes.len();
            if tx.send(Ok(bytes)).await.is_err() {
                return;
            }
            if sent >= config.response_limit {
                // Rotation: end the response, the client reconnects.
                tracing::debug!(
                    session_id = %guard.session().id(),
                    sent = sent,
                    "Response limit reached, rotating receiver"
                );
                return;
            }
        }
    });
    framed_response(transport, Body::from_stream(ReceiverStream::new(rx)))
}

enum SendAck {
    NoContent,
    Ok,
}

/// Inbound half for the polling family: a separate request that feeds the
/// session without ever touching the receiver slot.
async fn send_class(
    state: AppState,
    session_id: String,
    payloads: Result<Vec<String>, SessionError>,
    ack: SendAck,
) -> Response {
    let Some(session) = state.registry.resolve(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let payloads = match payloads {
        Ok(payloads) => payloads,
        Err(err) => return protocol_error_response(err),
    };
    match session.receive(payloads).await {
        Ok(()) => match ack {
            SendAck::NoContent => (
                StatusCode::NO_CONTENT,
                [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            )
                .into_response(),
            SendAck::Ok => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
                "ok",
            )
                .into_response(),
        },
        Err(err) => protocol_error_response(err),
    }
}

fn protocol_error_response(err: SessionError) -> Response {
    match err {
        SessionError::NotFound | SessionError::Closed => StatusCode::NOT_FOUND.into_response(),
        SessionError::MalformedPayload(msg) => {
            (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
        }
        SessionError::AlreadyAttached => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn framed_response(transport: Transport, body: impl IntoResponse) -> Response {
    (
        [
            (header::CONTENT_TYPE, transport.content_type()),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        body,
    )
        .into_response()
}

/// Decode a posted message batch: strictly a JSON array of strings. Empty and
/// unparsable bodies use the exact error bodies clients test against.
pub(crate) fn decode_payload(body: &[u8]) -> Result<Vec<String>, SessionError> {
    if body.is_empty() {
        return Err(SessionError::MalformedPayload("Payload expected."));
    }
    serde_json::from_slice::<Vec<String>>(body)
        .map_err(|_| SessionError::MalformedPayload("Broken JSON encoding."))
}

/// jsonp_send accepts either a raw JSON body or a form-encoded `d` field.
pub(crate) fn jsonp_send_payload(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Vec<String>, SessionError> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return decode_payload(body);
    }
    #[derive(serde::Deserialize)]
    struct SendForm {
        d: Option<String>,
    }
    let form: SendForm = serde_urlencoded::from_bytes(body)
        .map_err(|_| SessionError::MalformedPayload("Payload expected."))?;
    match form.d {
        Some(d) if !d.is_empty() => decode_payload(d.as_bytes()),
        _ => Err(SessionError::MalformedPayload("Payload expected.")),
    }
}

/// The `c` query parameter for script transports: the client-chosen callback
/// name, restricted to characters that are safe inside a script body.
fn callback_param(params: &HashMap<String, String>) -> Option<String> {
    let callback = params.get("c").or_else(|| params.get("callback"))?;
    if callback.is_empty()
        || !callback
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return None;
    }
    Some(callback.clone())
}

/// The outer router already constrains the path shape; this mirrors the
/// original id grammar (word characters, dashes, spaces).
fn valid_session_segments(server: &str, session_id: &str) -> bool {
    let ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ' | '.'))
    };
    ok(server) && ok(session_id)
}

// Static endpoints around the session machinery.

pub(crate) async fn greeting() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        "Welcome to SockJS!\n",
    )
        .into_response()
}

/// The capability document transport negotiation starts from. The two
/// booleans are static configuration passed through, never computed.
pub(crate) async fn info(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "websocket": state.config.websocket_enabled,
        "cookie_needed": state.config.cookie_needed,
        "origins": ["*:*"],
        "entropy": rand::random::<u32>(),
    });
    (
        [
            (header::CONTENT_TYPE, "application/json; charset=UTF-8"),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        body.to_string(),
    )
        .into_response()
}

pub(crate) async fn info_options() -> Response {
    (
        StatusCode::NO_CONTENT,
        [(header::CACHE_CONTROL, CACHE_ONE_YEAR)],
    )
        .into_response()
}

/// Everything unmatched lands here; `iframe*.html` serves the bootstrap
/// document, the rest is a plain 404.
pub(crate) async fn iframe_or_404(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let middle = path
        .strip_prefix("iframe")
        .and_then(|rest| rest.strip_suffix(".html"));
    let is_iframe = matches!(middle, Some(m) if m
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ')));
    if !is_iframe {
        return StatusCode::NOT_FOUND.into_response();
    }
    let doc = format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
  <script src="{}"></script>
  <script>
    document.domain = document.domain;
    SockJS.bootstrap_iframe();
  </script>
</head>
<body>
  <h2>Don't panic!</h2>
  <p>This is a SockJS hidden iframe. It's used for cross domain magic.</p>
</body>
</html>
"#,
        state.config.sockjs_url
    );
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=UTF-8"),
            (header::CACHE_CONTROL, CACHE_ONE_YEAR),
        ],
        doc,
    )
        .into_response()
}
