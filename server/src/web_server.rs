//! Router assembly and the terminal-facing HTTP surface: session CRUD
//! proxied to the daemon, shortcuts, instance config, uploads, connect info,
//! and health. Protected routes sit behind the auth middleware; public auth
//! endpoints carry a hard body limit.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{middleware, Extension, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use bytes::Bytes;
use katulong_core::protocol::Shortcut;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth_routes;
use crate::error::ApiError;
use crate::state::{request_tier, AppState, AuthCtx, ListenerTls, SESSION_COOKIE};
use crate::tls::ca_cert_path;
use crate::upload;
use crate::ws;

/// Body cap on the public auth endpoints.
const AUTH_BODY_LIMIT: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/logout", post(auth_routes::logout))
        .route("/auth/pair/start", post(auth_routes::pair_start))
        .route("/api/credentials", get(auth_routes::list_credentials))
        .route("/api/credentials/{id}", delete(auth_routes::delete_credential))
        .route("/api/tokens", get(auth_routes::list_tokens).post(auth_routes::create_token))
        .route(
            "/api/tokens/{id}",
            patch(auth_routes::rename_token).delete(auth_routes::revoke_token),
        )
        .route("/api/config", get(get_config))
        .route("/api/config/{key}", put(put_config))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{name}", put(rename_session).delete(delete_session))
        .route("/shortcuts", get(get_shortcuts).put(put_shortcuts))
        .route("/ssh/password", get(ssh_password))
        .route(
            "/upload",
            post(handle_upload).layer(DefaultBodyLimit::max(upload::UPLOAD_LIMIT_BYTES)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), crate::state::require_auth));

    let public_auth = Router::new()
        .route("/auth/status", get(auth_routes::auth_status))
        .route("/auth/register/options", post(auth_routes::register_options))
        .route("/auth/register/verify", post(auth_routes::register_verify))
        .route("/auth/login/options", post(auth_routes::login_options))
        .route("/auth/login/verify", post(auth_routes::login_verify))
        .route("/auth/pair/verify", post(auth_routes::pair_verify))
        .route("/auth/pair/status/{code}", get(auth_routes::pair_status))
        .layer(DefaultBodyLimit::max(AUTH_BODY_LIMIT));

    Router::new()
        .merge(protected)
        .merge(public_auth)
        .route("/", get(index))
        .route("/login", get(login_page))
        .route("/pair", get(pair_page))
        .route("/connect/info", get(connect_info))
        .route("/connect/trust", get(connect_trust))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/uploads/{file}", get(serve_upload))
        .fallback(static_fallback)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(ensure_host_header))
        .with_state(state)
}

/// HTTP/2 requests carry the host in the :authority pseudo-header; mirror it
/// into Host so tier detection and WebAuthn see one consistent value.
async fn ensure_host_header(mut req: Request, next: axum::middleware::Next) -> Response {
    if !req.headers().contains_key(header::HOST) {
        if let Some(authority) = req.uri().authority().map(|a| a.to_string()) {
            if let Ok(value) = authority.parse() {
                req.headers_mut().insert(header::HOST, value);
            }
        }
    }
    next.run(req).await
}

// ---- shell pages ----

/// GET / — the terminal shell. Unauthenticated non-local browsers go to the
/// login page instead of a bare 401.
async fn index(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let tier = request_tier(&state, &headers, addr.ip());
    let authed = tier.is_local()
        || jar
            .get(SESSION_COOKIE)
            .map(|c| state.store.validate_session(c.value()).is_ok())
            .unwrap_or(false);
    if !authed {
        return Redirect::to("/login").into_response();
    }
    state.static_cache.serve(&state.cfg.public_dir, "/index.html").await
}

async fn login_page(State(state): State<AppState>) -> Response {
    state.static_cache.serve(&state.cfg.public_dir, "/login.html").await
}

async fn pair_page(State(state): State<AppState>) -> Response {
    state.static_cache.serve(&state.cfg.public_dir, "/pair.html").await
}

/// Everything else under / is a public static asset.
async fn static_fallback(State(state): State<AppState>, req: Request) -> Response {
    if req.method() != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = req.uri().path().to_string();
    state.static_cache.serve(&state.cfg.public_dir, &path).await
}

/// GET /uploads/{file} — uploaded images, referenced by the instance icon.
async fn serve_upload(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    state.static_cache.serve(&state.uploads_dir(), &format!("/{file}")).await
}

// ---- sessions (proxied to the daemon) ----

async fn list_sessions(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.daemon.list_sessions().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    name: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, ApiError> {
    let name = state.daemon.create_session(&body.name).await?;
    Ok((StatusCode::CREATED, Json(json!({ "name": name }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameSessionBody {
    new_name: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RenameSessionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = state.daemon.rename_session(&name, &body.new_name).await?;
    Ok(Json(json!({ "name": name })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.daemon.delete_session(&name).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---- shortcuts ----

async fn get_shortcuts(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let shortcuts = state.daemon.get_shortcuts().await?;
    Ok(Json(json!({ "shortcuts": shortcuts })))
}

#[derive(Deserialize)]
struct PutShortcutsBody {
    shortcuts: Vec<Shortcut>,
}

async fn put_shortcuts(
    State(state): State<AppState>,
    Json(body): Json<PutShortcutsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.daemon.set_shortcuts(body.shortcuts).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---- instance config ----

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.store.config()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutConfigBody {
    #[serde(default)]
    instance_name: Option<String>,
    #[serde(default)]
    instance_icon: Option<String>,
    #[serde(default)]
    toolbar_color: Option<String>,
}

/// PUT /api/config/{instance-name|instance-icon|toolbar-color} — CSRF is
/// enforced by the protected-route middleware.
async fn put_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<PutConfigBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = match key.as_str() {
        "instance-name" => {
            let name = non_empty(body.instance_name, "instanceName")?;
            state.store.update_config(|c| c.instance_name = name)?
        }
        "instance-icon" => {
            let icon = body.instance_icon.filter(|s| !s.is_empty());
            state.store.update_config(|c| c.instance_icon = icon)?
        }
        "toolbar-color" => {
            let color = non_empty(body.toolbar_color, "toolbarColor")?;
            state.store.update_config(|c| c.toolbar_color = Some(color))?
        }
        _ => return Err(ApiError::NotFound),
    };
    Ok(Json(json!(config)))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, ApiError> {
    let value = value.map(|s| s.trim().to_string()).unwrap_or_default();
    if value.is_empty() || value.len() > 200 {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(value)
}

// ---- uploads ----

async fn handle_upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthCtx>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (path, absolute) = upload::store_upload(&state.uploads_dir(), &body).await?;
    let mut response = json!({ "path": path });
    // The filesystem path would be an info leak to remote clients.
    if ctx.tier.is_local() {
        response["absolutePath"] = json!(absolute);
    }
    Ok(Json(response))
}

// ---- ssh, connect, health ----

/// GET /ssh/password — localhost only; lets the local UI show the SSH
/// credentials for this instance.
async fn ssh_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthCtx>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !ctx.tier.is_local() {
        return Err(ApiError::Forbidden("localhost only".into()));
    }
    Ok(Json(json!({ "password": state.cfg.ssh_password })))
}

/// GET /connect/info — public metadata for the trust page.
async fn connect_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "lanIp": lan_ip(),
        "httpsPort": state.cfg.https_port,
        "mdnsName": mdns_name(),
    }))
}

/// GET /connect/trust — CA cert download; HTTP port only, so a device that
/// does not yet trust the CA can fetch it.
async fn connect_trust(
    State(state): State<AppState>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
) -> Response {
    if tls {
        return StatusCode::NOT_FOUND.into_response();
    }
    match tokio::fs::read(ca_cert_path(&state.tls_dir())).await {
        Ok(pem) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-x509-ca-cert".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"katulong-ca.pem\"".to_string(),
                ),
            ],
            pem,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let pid = std::process::id();
    if state.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "draining", "pid": pid })),
        )
            .into_response();
    }
    Json(json!({
        "status": "ok",
        "pid": pid,
        "uptime": state.started_at.elapsed().as_secs(),
        "daemonConnected": state.daemon.is_connected(),
    }))
    .into_response()
}

/// Best-effort LAN address: a routing probe that never sends a packet.
pub(crate) fn lan_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

pub(crate) fn mdns_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| format!("{}.local", h.trim_end_matches(".local")))
}
