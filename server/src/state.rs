//! Shared relay state plus the per-request auth context. The state owns the
//! transport tables (live WS peers) and holds lookups into the auth store and
//! the daemon client; it never owns credentials or sessions itself.

use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use dashmap::DashMap;
use katulong_core::auth::{AuthStore, Lockouts, SessionRecord};
use katulong_core::client::DaemonClient;
use tokio::sync::{mpsc, watch};

use crate::access::{constant_time_eq, detect_tier, AccessTier};
use crate::error::ApiError;
use crate::pairing::PairingState;
use crate::static_files::StaticCache;
use crate::webauthn::WebauthnFlows;

/// Session cookie name; HttpOnly, SameSite=Lax, Secure on the TLS listener.
pub const SESSION_COOKIE: &str = "katulong_session";
/// CSRF header required on state-changing non-local requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Marks which listener (plain HTTP or TLS) accepted the request.
#[derive(Debug, Clone, Copy)]
pub struct ListenerTls(pub bool);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub https_port: Option<u16>,
    pub ssh_port: Option<u16>,
    pub data_dir: PathBuf,
    pub socket: PathBuf,
    pub public_dir: PathBuf,
    /// Active SSH password; also served on /ssh/password to localhost.
    pub ssh_password: String,
    /// SETUP_TOKEN from the environment; accepted as a non-consumable setup
    /// token for registration.
    pub setup_token_env: Option<String>,
    /// Test bypass: treat every request as localhost. Filtered from shells.
    pub no_auth: bool,
}

/// One live WebSocket, registered for revocation close, shutdown close, and
/// p2p signal routing.
pub struct WsPeer {
    pub client_id: String,
    pub credential_id: Option<String>,
    pub tier: AccessTier,
    pub tx: mpsc::UnboundedSender<Message>,
}

pub struct AppStateInner {
    pub store: Arc<AuthStore>,
    pub daemon: DaemonClient,
    pub lockouts: Lockouts,
    pub pairing: PairingState,
    pub flows: WebauthnFlows,
    pub sockets: DashMap<u64, WsPeer>,
    pub next_socket: AtomicU64,
    pub draining: AtomicBool,
    pub shutdown: watch::Sender<bool>,
    pub started_at: Instant,
    pub static_cache: StaticCache,
    pub cfg: ServerConfig,
}

#[derive(Clone)]
pub struct AppState(pub Arc<AppStateInner>);

impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppState {
    pub fn new(store: Arc<AuthStore>, daemon: DaemonClient, cfg: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self(Arc::new(AppStateInner {
            store,
            daemon,
            lockouts: Lockouts::new(),
            pairing: PairingState::new(),
            flows: WebauthnFlows::default(),
            sockets: DashMap::new(),
            next_socket: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            shutdown,
            started_at: Instant::now(),
            static_cache: StaticCache::default(),
            cfg,
        }))
    }

    pub fn register_socket(&self, peer: WsPeer) -> u64 {
        let id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        self.sockets.insert(id, peer);
        id
    }

    pub fn unregister_socket(&self, id: u64) {
        self.sockets.remove(&id);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.cfg.data_dir.join("uploads")
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.cfg.data_dir.join("tls")
    }
}

/// The tier of this request, honoring the KATULONG_NO_AUTH test bypass.
pub fn request_tier(state: &AppState, headers: &HeaderMap, peer: IpAddr) -> AccessTier {
    if state.cfg.no_auth {
        return AccessTier::Localhost;
    }
    detect_tier(peer, header_str(headers, header::HOST), header_str(headers, header::ORIGIN))
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Per-request authentication result, attached as a request extension by
/// [`require_auth`].
#[derive(Clone)]
pub struct AuthCtx {
    pub tier: AccessTier,
    /// None on the localhost tier, where auth is bypassed.
    pub session: Option<SessionRecord>,
}

impl AuthCtx {
    pub fn credential_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.credential_id.as_str())
    }
}

/// Protected-route middleware. Localhost bypasses auth entirely; LAN and
/// internet callers need a valid session cookie, and state-changing methods
/// additionally need the session's CSRF token, compared in constant time.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = match peer_ip(&req) {
        Some(ip) => ip,
        None => return ApiError::Internal(anyhow::anyhow!("missing peer address")).into_response(),
    };
    let tier = request_tier(&state, req.headers(), peer);
    if tier.is_local() {
        req.extensions_mut().insert(AuthCtx { tier, session: None });
        return next.run(req).await;
    }

    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return ApiError::Unauthenticated.into_response();
    };
    let session = match state.store.validate_session(cookie.value()) {
        Ok(s) => s,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let state_changing = [Method::POST, Method::PUT, Method::PATCH, Method::DELETE]
        .contains(req.method());
    if state_changing {
        let presented = req.headers().get(CSRF_HEADER).and_then(|v| v.to_str().ok());
        let ok = presented
            .map(|token| constant_time_eq(token, &session.csrf_token))
            .unwrap_or(false);
        if !ok {
            return ApiError::Forbidden("csrf token missing or invalid".into()).into_response();
        }
    }

    req.extensions_mut().insert(AuthCtx { tier, session: Some(session) });
    next.run(req).await
}

pub fn peer_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}
