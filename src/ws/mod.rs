//! WebSocket transport for visitor terminals.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws?token=<t>&visitorId=<id>`. The upgrade is
//!    always accepted so that refusals can carry a close code a browser can
//!    read.
//! 2. Handshake: the source address must not be rate limited, then the
//!    visitor must either be an already-authorized identity or present a
//!    valid token. Refusals close with `4001` (rejected) or `4029` (rate
//!    limited, preceded by an `error` message carrying `retryAfter`).
//! 3. Bound: a default shell is created if the visitor has none, the
//!    `session` snapshot and each terminal's replay are queued, and the
//!    connection joins the visitor's fan-out.
//! 4. Messages follow the protocol in [`crate::protocol`]. Frames that do not
//!    parse are logged and dropped; the connection stays open.
//! 5. A connection that cannot keep up with the fan-out is closed with `1013`
//!    so the client reconnects and replays.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::HandshakeError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rate_limit::Decision;
use crate::AppState;

/// Longest accepted client-supplied visitor id.
const MAX_VISITOR_ID: usize = 128;

/// How long to wait for queued frames to flush after the loop ends.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Query parameters for the WebSocket upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Access token (query parameter, since browsers cannot set headers on a
    /// WebSocket upgrade).
    #[serde(default)]
    pub token: Option<String>,
    /// Reconnect identity kept by the client across reconnects.
    #[serde(default, rename = "visitorId")]
    pub visitor_id: Option<String>,
}

/// `GET /ws`: WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(addr, &headers, state.config.server.trust_forwarded_for);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip, query))
}

/// Source address for rate limiting. `X-Forwarded-For` is honoured only when
/// the deployment says a trusted proxy sits in front, and then only its
/// rightmost entry: the one that proxy appended. Earlier entries come from
/// the client.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get_all("x-forwarded-for")
            .iter()
            .next_back()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

fn is_valid_visitor_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_VISITOR_ID
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Gate a connection. Returns the visitor id to bind to.
pub async fn authenticate(
    state: &AppState,
    ip: IpAddr,
    query: &ConnectQuery,
) -> Result<String, HandshakeError> {
    if let Decision::Blocked { retry_after } = state.rate_limiter.is_allowed(ip).await {
        return Err(HandshakeError::RateLimited { retry_after });
    }

    let visitor_id = match query.visitor_id.as_deref() {
        Some(id) if is_valid_visitor_id(id) => id.to_string(),
        _ => format!("visitor-{}", Uuid::new_v4()),
    };

    if state.auth.is_authorized(&visitor_id).await {
        state.rate_limiter.record_success(ip).await;
        return Ok(visitor_id);
    }

    let token = query.token.as_deref().unwrap_or("");
    match state.auth.authorize(token, &visitor_id).await {
        Ok(()) => {
            state.rate_limiter.record_success(ip).await;
            Ok(visitor_id)
        }
        Err(reason) => match state.rate_limiter.record_failure(ip).await {
            Decision::Blocked { retry_after } => Err(HandshakeError::RateLimited { retry_after }),
            Decision::Allowed => Err(reason.into()),
        },
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, ip: IpAddr, query: ConnectQuery) {
    match authenticate(&state, ip, &query).await {
        Ok(visitor_id) => {
            info!("Connection from {ip} authenticated as {visitor_id}");
            run_connection(socket, state, visitor_id).await;
        }
        Err(e) => {
            warn!("Handshake from {ip} refused: {e}");
            if let HandshakeError::RateLimited { retry_after } = &e {
                let msg = ServerMessage::Error {
                    message: "Too many failed attempts".to_string(),
                    retry_after: Some(retry_after.as_secs().max(1)),
                };
                if let Ok(text) = msg.to_json() {
                    let _ = socket.send(Message::Text(text.into())).await;
                }
            }
            let frame = CloseFrame {
                code: e.close_code(),
                reason: e.close_reason().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
        }
    }
}

/// Main event loop for an authenticated connection.
///
/// Outgoing frames go through a bounded channel drained by a send task, which
/// is also the channel registered with the visitor's fan-out. The loop ends
/// on client close, eviction, or server shutdown.
async fn run_connection(socket: WebSocket, state: AppState, visitor_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.server.outbound_queue.max(16));
    let (close_tx, mut close_rx) = oneshot::channel::<CloseFrame>();

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = &mut close_rx => {
                    if let Ok(frame) = frame {
                        let _ = ws_sink.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("WS send: failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let ensured = state.registry.ensure_terminal(&visitor_id).await;
    let token_info = state.auth.token_info().await;
    let subscription = state.registry.bind(&visitor_id, tx.clone(), token_info).await;
    let connection = subscription.id();
    let evicted = subscription.evicted().clone();
    // The snapshot is already queued; errors follow it.
    if let Err(e) = ensured {
        warn!("Visitor {visitor_id}: default terminal not created: {e}");
        reply(&tx, ServerMessage::error(e.to_string()));
    }

    let close = loop {
        tokio::select! {
            () = evicted.cancelled() => {
                break Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "Too slow; reconnect to replay".into(),
                });
            }
            () = state.shutdown.cancelled() => {
                break Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "Server shutting down".into(),
                });
            }
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                    Ok(msg) => dispatch(&state, &visitor_id, &tx, msg).await,
                    Err(e) => warn!("Visitor {visitor_id}: dropping unparseable message: {e}"),
                },
                Some(Ok(Message::Close(_)) | Err(_)) | None => break None,
                Some(Ok(_)) => {}
            },
        }
    };

    subscription.unbind().await;
    if let Some(frame) = close {
        let _ = close_tx.send(frame);
    } else {
        drop(close_tx);
    }
    drop(tx);
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, send_task).await.is_err() {
        debug!("Visitor {visitor_id}: send task did not finish in time");
    }
    info!("Connection {connection} closed for visitor {visitor_id}; terminals preserved");
}

/// Queue a reply for this connection only. A full queue means the fan-out
/// is about to evict the connection anyway.
fn reply(tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if tx.try_send(msg).is_err() {
        debug!("Reply dropped: outbound queue full or closed");
    }
}

/// Apply one client message.
async fn dispatch(
    state: &AppState,
    visitor_id: &str,
    tx: &mpsc::Sender<ServerMessage>,
    msg: ClientMessage,
) {
    let registry = &state.registry;
    match msg {
        ClientMessage::Input { terminal_id, data } => {
            if let Err(e) = registry.write(visitor_id, &terminal_id, data.into_bytes()).await {
                reply(tx, ServerMessage::error(e.to_string()));
            }
        }
        ClientMessage::Resize {
            terminal_id,
            cols,
            rows,
        } => {
            registry.resize(visitor_id, &terminal_id, cols, rows).await;
        }
        ClientMessage::CreateTerminal { name } => {
            if let Err(e) = registry.create_terminal(visitor_id, name).await {
                reply(tx, ServerMessage::error(e.to_string()));
            }
        }
        ClientMessage::CloseTerminal {
            terminal_id,
            destroy_session,
        } => {
            let result = registry
                .close_terminal(visitor_id, &terminal_id, destroy_session)
                .await;
            if let Err(e) = result {
                reply(tx, ServerMessage::error(e.to_string()));
            } else if destroy_session {
                let multiplexer_info = registry.multiplexer().info().await;
                registry
                    .broadcast(visitor_id, &ServerMessage::SessionsList { multiplexer_info })
                    .await;
            }
        }
        ClientMessage::RenameTerminal { terminal_id, name } => {
            if let Err(e) = registry.rename(visitor_id, &terminal_id, &name).await {
                reply(tx, ServerMessage::error(e.to_string()));
            }
        }
        ClientMessage::SwitchTerminal { terminal_id } => {
            match registry.set_active(visitor_id, &terminal_id).await {
                Ok(()) => reply(tx, ServerMessage::TerminalSwitched { terminal_id }),
                Err(e) => reply(tx, ServerMessage::error(e.to_string())),
            }
        }
        ClientMessage::GetTerminals => {
            let terminals = registry.list_terminals(visitor_id).await;
            reply(tx, ServerMessage::TerminalsList { terminals });
        }
        ClientMessage::GetSessions => {
            let multiplexer_info = registry.multiplexer().info().await;
            reply(tx, ServerMessage::SessionsList { multiplexer_info });
        }
        ClientMessage::CreateSession { session_name } => {
            let result = registry
                .create_multiplexer_session(visitor_id, &session_name)
                .await;
            after_session_change(state, visitor_id, tx, result.map(|_| ())).await;
        }
        ClientMessage::AttachSession { session_name } => {
            let result = registry
                .attach_multiplexer_session(visitor_id, &session_name)
                .await;
            after_session_change(state, visitor_id, tx, result.map(|_| ())).await;
        }
        ClientMessage::Ping => reply(tx, ServerMessage::Pong),
    }
}

/// Refresh everyone's session list after a tmux terminal was opened, or
/// report the failure to the requester.
async fn after_session_change(
    state: &AppState,
    visitor_id: &str,
    tx: &mpsc::Sender<ServerMessage>,
    result: Result<(), crate::error::TerminalError>,
) {
    match result {
        Ok(()) => {
            let multiplexer_info = state.registry.multiplexer().info().await;
            state
                .registry
                .broadcast(visitor_id, &ServerMessage::SessionsList { multiplexer_info })
                .await;
        }
        Err(e) => reply(tx, ServerMessage::error(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.5:51000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_uses_entry_appended_by_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 198.51.100.9"),
        );
        assert_eq!(client_ip(peer(), &headers, false), peer().ip());
        assert_eq!(
            client_ip(peer(), &headers, true),
            "198.51.100.9".parse::<IpAddr>().unwrap()
        );

        // Repeated headers: the last one is the proxy's.
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.append("x-forwarded-for", HeaderValue::from_static("198.51.100.9"));
        assert_eq!(
            client_ip(peer(), &headers, true),
            "198.51.100.9".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_spoofed_forwarded_for_entries_still_get_blocked() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(300));
        let real: IpAddr = "198.51.100.9".parse().unwrap();
        for i in 0..50 {
            let mut headers = HeaderMap::new();
            let value = format!("203.0.113.{i}, {real}");
            headers.insert("x-forwarded-for", HeaderValue::from_str(&value).unwrap());
            let ip = client_ip(peer(), &headers, true);
            assert_eq!(ip, real);
            limiter.record_failure(ip).await;
        }
        assert!(!limiter.is_allowed(real).await.is_allowed());
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(peer(), &headers, true), peer().ip());
        assert_eq!(client_ip(peer(), &HeaderMap::new(), true), peer().ip());
    }

    #[test]
    fn test_visitor_id_validation() {
        assert!(is_valid_visitor_id("visitor-1b2c"));
        assert!(!is_valid_visitor_id(""));
        assert!(!is_valid_visitor_id("a b"));
        assert!(!is_valid_visitor_id(&"v".repeat(MAX_VISITOR_ID + 1)));
    }

    #[test]
    fn test_connect_query_accepts_missing_fields() {
        let q: ConnectQuery = serde_json::from_str("{}").unwrap();
        assert!(q.token.is_none() && q.visitor_id.is_none());
        let q: ConnectQuery =
            serde_json::from_str(r#"{"token":"t","visitorId":"v"}"#).unwrap();
        assert_eq!(q.visitor_id.as_deref(), Some("v"));
    }
}
