//! The WebSocket path: upgrade guards, JSON message routing to the daemon,
//! and forwarding of daemon broadcasts to attached clients. Every incoming
//! message re-validates the session; revocation closes the socket with 1008,
//! graceful shutdown with 1001, and the two must never be confused.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use katulong_core::auth::AuthEvent;
use katulong_core::client::{DaemonEvent, RpcError};
use katulong_core::protocol::{sanitize_session_name, DaemonMsg};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::access::strip_port;
use crate::state::{header_str, request_tier, AppState, WsPeer, SESSION_COOKIE};

/// Graceful shutdown; clients reconnect transparently.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Session or credential no longer valid; clients go to the login page.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Application-level heartbeat; detects half-open connections and bounds the
/// revocation window for idle sockets.
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum WsClientMsg {
    Attach {
        session: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    P2pSignal {
        data: serde_json::Value,
    },
    Ping,
}

/// The synchronous part of the upgrade decision, separated from the
/// handshake so the guard logic is testable on its own.
#[derive(Debug)]
struct UpgradeAuth {
    tier: crate::access::AccessTier,
    session_token: Option<String>,
    credential_id: Option<String>,
}

fn authorize_upgrade(
    state: &AppState,
    headers: &HeaderMap,
    peer: std::net::IpAddr,
) -> Result<UpgradeAuth, StatusCode> {
    let tier = request_tier(state, headers, peer);
    if tier.is_local() {
        return Ok(UpgradeAuth { tier, session_token: None, credential_id: None });
    }

    // CSWSH guard: Origin must be present and name this very host.
    let Some(origin) = header_str(headers, header::ORIGIN) else {
        return Err(StatusCode::FORBIDDEN);
    };
    let Some(host) = header_str(headers, header::HOST) else {
        return Err(StatusCode::FORBIDDEN);
    };
    let origin_host = origin.split_once("://").map(|(_, rest)| rest).unwrap_or(origin);
    let origin_host = origin_host.split('/').next().unwrap_or(origin_host);
    if strip_port(origin_host) != strip_port(host) {
        return Err(StatusCode::FORBIDDEN);
    }

    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(cookie_value)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    match state.store.validate_session(&cookie) {
        Ok(session) => Ok(UpgradeAuth {
            tier,
            credential_id: Some(session.credential_id),
            session_token: Some(session.token),
        }),
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}

fn cookie_value(cookie_header: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = match authorize_upgrade(&state, &headers, addr.ip()) {
        Ok(auth) => auth,
        Err(status) => return status.into_response(),
    };
    if state.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| {
        handle_socket(state, socket, auth.tier, auth.session_token, auth.credential_id)
    })
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    tier: crate::access::AccessTier,
    session_token: Option<String>,
    credential_id: Option<String>,
) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Message>();
    let sock_id = state.register_socket(WsPeer {
        client_id: client_id.clone(),
        credential_id: credential_id.clone(),
        tier,
        tx: peer_tx,
    });
    debug!(client = %client_id, "ws connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut daemon_events = state.daemon.subscribe();
    let mut auth_events = state.store.subscribe();
    let mut shutdown = state.shutdown.subscribe();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // the first tick completes immediately

    // The session this socket is viewing; rewritten on rename.
    let mut attached: Option<String> = None;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break };
                // Re-validate before acting on anything the client sent.
                if !session_still_valid(&state, &session_token, &credential_id) {
                    let _ = ws_tx.send(close_frame(CLOSE_POLICY_VIOLATION, "session revoked")).await;
                    break;
                }
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<WsClientMsg>(&text) {
                    Ok(msg) => {
                        if let Err(e) = handle_client_msg(
                            &state, &client_id, sock_id, &credential_id, tier, msg,
                            &mut attached, &mut ws_tx,
                        )
                        .await
                        {
                            let _ = send_json(&mut ws_tx, &serde_json::json!({
                                "type": "error",
                                "error": e,
                            }))
                            .await;
                        }
                    }
                    // Unknown or malformed types are an error, not a close.
                    Err(_) => {
                        let _ = send_json(&mut ws_tx, &serde_json::json!({
                            "type": "error",
                            "error": "bad request",
                        }))
                        .await;
                    }
                }
            }
            routed = peer_rx.recv() => {
                let Some(msg) = routed else { break };
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            event = daemon_events.recv() => {
                match event {
                    Ok(event) => {
                        if !forward_daemon_event(&state, &client_id, event, &mut attached, &mut ws_tx).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(client = %client_id, lagged = n, "ws fell behind daemon events");
                        continue;
                    }
                    Err(_) => break,
                }
            }
            event = auth_events.recv() => {
                match event {
                    Ok(AuthEvent::CredentialDeleted { credential_id: deleted }) => {
                        if credential_id.as_deref() == Some(deleted.as_str()) {
                            let _ = ws_tx.send(close_frame(CLOSE_POLICY_VIOLATION, "credential revoked")).await;
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed events: fail closed by re-checking the session.
                        if !session_still_valid(&state, &session_token, &credential_id) {
                            let _ = ws_tx.send(close_frame(CLOSE_POLICY_VIOLATION, "session revoked")).await;
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(close_frame(CLOSE_GOING_AWAY, "server shutting down")).await;
                break;
            }
            _ = ping.tick() => {
                if !session_still_valid(&state, &session_token, &credential_id) {
                    let _ = ws_tx.send(close_frame(CLOSE_POLICY_VIOLATION, "session revoked")).await;
                    break;
                }
                if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                let _ = send_json(&mut ws_tx, &serde_json::json!({ "type": "ping" })).await;
            }
        }
    }

    state.unregister_socket(sock_id);
    state.daemon.detach(&client_id).await;
    debug!(client = %client_id, "ws disconnected");
}

fn session_still_valid(
    state: &AppState,
    session_token: &Option<String>,
    credential_id: &Option<String>,
) -> bool {
    match session_token {
        // Localhost sockets carry no session.
        None => true,
        Some(token) => {
            if state.store.validate_session(token).is_err() {
                return false;
            }
            credential_id
                .as_deref()
                .map(|id| state.store.credential_exists(id))
                .unwrap_or(true)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_msg(
    state: &AppState,
    client_id: &str,
    sock_id: u64,
    credential_id: &Option<String>,
    tier: crate::access::AccessTier,
    msg: WsClientMsg,
    attached: &mut Option<String>,
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), String> {
    match msg {
        WsClientMsg::Attach { session, cols, rows } => {
            let Some(name) = sanitize_session_name(&session) else {
                return Err("invalid session name".into());
            };
            match state.daemon.attach(client_id, &name, cols, rows).await {
                Ok((buffer, alive)) => {
                    *attached = Some(name.clone());
                    let _ = send_json(ws_tx, &serde_json::json!({
                        "type": "attached",
                        "session": name,
                        "alive": alive,
                    }))
                    .await;
                    // Seed the scrollback as one output message, then stream.
                    if !buffer.is_empty() {
                        let _ = send_json(ws_tx, &serde_json::json!({
                            "type": "output",
                            "session": name,
                            "data": buffer,
                        }))
                        .await;
                    }
                    Ok(())
                }
                Err(RpcError::Daemon(e)) => Err(e),
                Err(_) => Err("daemon unavailable".into()),
            }
        }
        WsClientMsg::Input { data } => {
            let _ = state.daemon.input(client_id, &data).await;
            Ok(())
        }
        WsClientMsg::Resize { cols, rows } => {
            let _ = state.daemon.resize(client_id, cols, rows).await;
            Ok(())
        }
        WsClientMsg::P2pSignal { data } => {
            // Relay SDP/ICE blobs between this client's other sockets; the
            // relay is not a WebRTC endpoint and never inspects the payload.
            let frame = serde_json::json!({ "type": "p2p-signal", "data": data }).to_string();
            for peer in state.sockets.iter() {
                if *peer.key() == sock_id {
                    continue;
                }
                let same_owner = match credential_id {
                    Some(id) => peer.credential_id.as_deref() == Some(id.as_str()),
                    None => peer.credential_id.is_none() && peer.tier == tier,
                };
                if same_owner {
                    let _ = peer.tx.send(Message::Text(frame.clone().into()));
                }
            }
            Ok(())
        }
        WsClientMsg::Ping => {
            let _ = send_json(ws_tx, &serde_json::json!({ "type": "pong" })).await;
            Ok(())
        }
    }
}

/// Forward one daemon event to this socket. Returns false when the socket
/// should close.
async fn forward_daemon_event(
    state: &AppState,
    client_id: &str,
    event: DaemonEvent,
    attached: &mut Option<String>,
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
) -> bool {
    match event {
        DaemonEvent::Broadcast(DaemonMsg::Output { session, data }) => {
            if attached.as_deref() == Some(session.as_str()) {
                return send_json(ws_tx, &serde_json::json!({
                    "type": "output",
                    "session": session,
                    "data": data,
                }))
                .await
                .is_ok();
            }
            true
        }
        DaemonEvent::Broadcast(DaemonMsg::Exit { session, code }) => {
            if attached.as_deref() == Some(session.as_str()) {
                return send_json(ws_tx, &serde_json::json!({
                    "type": "exit",
                    "session": session,
                    "code": code,
                }))
                .await
                .is_ok();
            }
            true
        }
        DaemonEvent::Broadcast(DaemonMsg::SessionRemoved { session }) => {
            if attached.as_deref() == Some(session.as_str()) {
                *attached = None;
                return send_json(ws_tx, &serde_json::json!({
                    "type": "session-removed",
                    "session": session,
                }))
                .await
                .is_ok();
            }
            true
        }
        DaemonEvent::Broadcast(DaemonMsg::SessionRenamed { session, new_name }) => {
            if attached.as_deref() == Some(session.as_str()) {
                *attached = Some(new_name.clone());
                return send_json(ws_tx, &serde_json::json!({
                    "type": "session-renamed",
                    "session": session,
                    "newName": new_name,
                }))
                .await
                .is_ok();
            }
            true
        }
        // The daemon came back: re-issue the attachment so output resumes.
        DaemonEvent::Connected => {
            if let Some(session) = attached.clone() {
                if let Ok((buffer, alive)) = state.daemon.attach(client_id, &session, None, None).await {
                    let _ = send_json(ws_tx, &serde_json::json!({
                        "type": "attached",
                        "session": session,
                        "alive": alive,
                    }))
                    .await;
                    if !buffer.is_empty() {
                        let _ = send_json(ws_tx, &serde_json::json!({
                            "type": "output",
                            "session": session,
                            "data": buffer,
                        }))
                        .await;
                    }
                }
            }
            true
        }
        DaemonEvent::Disconnected | DaemonEvent::Broadcast(_) => true,
    }
}

async fn send_json(
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
    value: &serde_json::Value,
) -> Result<(), ()> {
    ws_tx
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| ())
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::ServerConfig;
    use chrono::Utc;
    use katulong_core::auth::{AuthStore, CredentialRecord};
    use katulong_core::client::DaemonClient;

    fn test_state(dir: &std::path::Path) -> AppState {
        let store = AuthStore::open(dir).unwrap();
        let daemon = DaemonClient::new(dir.join("daemon.sock"));
        AppState::new(store, daemon, ServerConfig {
            http_port: 3001,
            https_port: None,
            ssh_port: None,
            data_dir: dir.to_path_buf(),
            socket: dir.join("daemon.sock"),
            public_dir: dir.to_path_buf(),
            ssh_password: "pw".into(),
            setup_token_env: None,
            no_auth: false,
        })
    }

    fn add_session(state: &AppState, cred: &str) -> String {
        let now = Utc::now();
        state
            .store
            .register_credential(
                CredentialRecord {
                    id: cred.into(),
                    passkey: serde_json::json!({}),
                    device_id: None,
                    name: "dev".into(),
                    created_at: now,
                    last_used_at: now,
                    user_agent: None,
                    transports: Vec::new(),
                },
                None,
            )
            .unwrap();
        state.store.create_session(cred).unwrap().token
    }

    fn headers(entries: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(name.clone(), value.parse().unwrap());
        }
        map
    }

    #[tokio::test]
    async fn localhost_upgrade_skips_origin_and_cookie_checks() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = authorize_upgrade(
            &state,
            &headers(&[(header::HOST, "localhost:3001")]),
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap();
        assert!(auth.session_token.is_none());
        assert!(auth.tier.is_local());
    }

    #[tokio::test]
    async fn non_local_upgrade_requires_matching_origin() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let peer = "127.0.0.1".parse().unwrap();

        // Tunnel host, no Origin at all.
        let err = authorize_upgrade(&state, &headers(&[(header::HOST, "example.tunnel.app")]), peer)
            .unwrap_err();
        assert_eq!(err, StatusCode::FORBIDDEN);

        // Cross-site origin.
        let err = authorize_upgrade(
            &state,
            &headers(&[
                (header::HOST, "example.tunnel.app"),
                (header::ORIGIN, "https://attacker.example.com"),
            ]),
            peer,
        )
        .unwrap_err();
        assert_eq!(err, StatusCode::FORBIDDEN);

        // Same-origin but anonymous.
        let err = authorize_upgrade(
            &state,
            &headers(&[
                (header::HOST, "example.tunnel.app"),
                (header::ORIGIN, "https://example.tunnel.app"),
            ]),
            peer,
        )
        .unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_local_upgrade_accepts_same_origin_with_valid_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let token = add_session(&state, "cred-a");
        let cookie = format!("{SESSION_COOKIE}={token}");

        let auth = authorize_upgrade(
            &state,
            &headers(&[
                (header::HOST, "example.tunnel.app"),
                (header::ORIGIN, "https://example.tunnel.app"),
                (header::COOKIE, cookie.as_str()),
            ]),
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(auth.credential_id.as_deref(), Some("cred-a"));
        assert_eq!(auth.session_token.as_deref(), Some(token.as_str()));

        // A stale cookie is refused.
        let err = authorize_upgrade(
            &state,
            &headers(&[
                (header::HOST, "example.tunnel.app"),
                (header::ORIGIN, "https://example.tunnel.app"),
                (header::COOKIE, "katulong_session=bogus"),
            ]),
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn cookie_header_parsing_finds_the_session() {
        assert_eq!(cookie_value("katulong_session=abc"), Some("abc".into()));
        assert_eq!(cookie_value("other=1; katulong_session=abc; x=2"), Some("abc".into()));
        assert_eq!(cookie_value("other=1"), None);
    }

    #[test]
    fn client_messages_parse_by_type_tag() {
        let msg: WsClientMsg =
            serde_json::from_str(r#"{"type":"attach","session":"dev","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(msg, WsClientMsg::Attach { session, cols: Some(80), rows: Some(24) } if session == "dev"));

        let msg: WsClientMsg = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(msg, WsClientMsg::Input { data } if data == "ls\n"));

        let msg: WsClientMsg = serde_json::from_str(r#"{"type":"p2p-signal","data":{"sdp":"x"}}"#).unwrap();
        assert!(matches!(msg, WsClientMsg::P2pSignal { .. }));

        assert!(serde_json::from_str::<WsClientMsg>(r#"{"type":"launch-missiles"}"#).is_err());
    }

    #[test]
    fn close_codes_are_distinct() {
        // 1001 reconnects, 1008 logs out; conflating them would turn every
        // restart into a forced logout.
        assert_ne!(CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION);
        assert_eq!(CLOSE_GOING_AWAY, 1001);
        assert_eq!(CLOSE_POLICY_VIOLATION, 1008);
    }
}
