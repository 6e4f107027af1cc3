//! Authentication endpoints: WebAuthn registration and login, logout,
//! pairing, credential and setup-token management. Registration outside
//! localhost needs a setup token (minted directly or through pairing); PIN
//! and login failures feed the lockout tracker.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use chrono::Utc;
use katulong_core::auth::CredentialRecord;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use webauthn_rs::prelude::{
    Passkey, PublicKeyCredential, RegisterPublicKeyCredential, Uuid,
};

use crate::access::constant_time_eq;
use crate::error::ApiError;
use crate::state::{header_str, request_tier, AppState, AuthCtx, ListenerTls, SESSION_COOKIE};
use crate::webauthn::{build_webauthn, credential_id_string, RegistrationGrant};

fn required_host(headers: &HeaderMap) -> Result<&str, ApiError> {
    header_str(headers, header::HOST).ok_or_else(|| ApiError::BadRequest("missing host header".into()))
}

fn session_cookie(token: String, tls: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(tls)
        .max_age(time::Duration::days(30))
        .build()
}

// ---- status ----

/// GET /auth/status — public. Tells the client whether setup has happened,
/// how it reached us, and (when the cookie is valid) its CSRF token so a
/// reloaded page can keep making state-changing calls.
pub async fn auth_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Json<serde_json::Value> {
    let tier = request_tier(&state, &headers, addr.ip());
    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|c| state.store.validate_session(c.value()).ok());
    let mut body = json!({
        "setup": state.store.is_setup(),
        "accessMethod": tier,
        "authenticated": tier.is_local() || session.is_some(),
    });
    if let Some(session) = session {
        body["csrfToken"] = json!(session.csrf_token);
    }
    Json(body)
}

// ---- registration ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOptionsBody {
    #[serde(default)]
    pub setup_token: Option<String>,
}

/// POST /auth/register/options — public. Allowed for localhost callers, for
/// holders of a live setup token (incl. the SETUP_TOKEN environment escape
/// hatch), and for already-authenticated sessions adding another device.
pub async fn register_options(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<RegisterOptionsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tier = request_tier(&state, &headers, addr.ip());
    let authed = jar
        .get(SESSION_COOKIE)
        .map(|c| state.store.validate_session(c.value()).is_ok())
        .unwrap_or(false);

    let grant = if tier.is_local() || authed {
        RegistrationGrant { setup_token: None }
    } else {
        let token = body
            .setup_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthenticated)?;
        if peek_env_setup_token(&state, token) {
            RegistrationGrant { setup_token: None }
        } else if state.store.peek_setup_token(token) {
            RegistrationGrant { setup_token: Some(token.to_string()) }
        } else {
            return Err(ApiError::Forbidden("invalid setup token".into()));
        }
    };

    let host = required_host(&headers)?;
    let webauthn = build_webauthn(host, tls)?;
    let (user_id, user_name) = match state.store.user() {
        Some(user) => (user.id, user.name),
        None => (Uuid::new_v4(), "katulong".to_string()),
    };
    let exclude: Vec<_> = stored_passkeys(&state).iter().map(|p| p.cred_id().clone()).collect();
    let exclude = if exclude.is_empty() { None } else { Some(exclude) };
    let (challenge, reg_state) = webauthn
        .start_passkey_registration(user_id, &user_name, &user_name, exclude)
        .map_err(|e| ApiError::BadRequest(format!("starting registration: {e}")))?;
    let flow_id = state.flows.insert_registration(reg_state, grant);

    Ok(Json(json!({ "flowId": flow_id, "options": challenge })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVerifyBody {
    pub flow_id: Uuid,
    pub credential: RegisterPublicKeyCredential,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// POST /auth/register/verify — public. Finishes the ceremony, persists the
/// credential (consuming the linked setup token atomically), and logs the new
/// device in.
pub async fn register_verify(
    State(state): State<AppState>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<RegisterVerifyBody>,
) -> Result<Response, ApiError> {
    let (reg_state, grant) = state
        .flows
        .take_registration(&body.flow_id)
        .ok_or_else(|| ApiError::BadRequest("unknown or expired registration flow".into()))?;

    let host = required_host(&headers)?;
    let webauthn = build_webauthn(host, tls)?;
    let passkey = webauthn
        .finish_passkey_registration(&body.credential, &reg_state)
        .map_err(|e| ApiError::BadRequest(format!("registration failed: {e}")))?;

    let id = credential_id_string(passkey.cred_id());
    let now = Utc::now();
    let record = CredentialRecord {
        id: id.clone(),
        passkey: serde_json::to_value(&passkey)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("encoding passkey: {e}")))?,
        device_id: body.device_id,
        name: body.name.unwrap_or_else(|| "New device".into()),
        created_at: now,
        last_used_at: now,
        user_agent: header_str(&headers, header::USER_AGENT).map(str::to_string),
        transports: Vec::new(),
    };
    state.store.register_credential(record, grant.setup_token.as_deref())?;
    info!(credential = %id, "credential registered");

    let session = state.store.create_session(&id)?;
    let jar = jar.add(session_cookie(session.token, tls));
    let body = Json(json!({
        "verified": true,
        "credentialId": id,
        "csrfToken": session.csrf_token,
    }));
    Ok((jar, body).into_response())
}

// ---- login ----

/// POST /auth/login/options — public.
pub async fn login_options(
    State(state): State<AppState>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let passkeys = stored_passkeys(&state);
    if passkeys.is_empty() {
        return Err(ApiError::BadRequest("no credentials registered".into()));
    }
    let host = required_host(&headers)?;
    let webauthn = build_webauthn(host, tls)?;
    let (challenge, auth_state) = webauthn
        .start_passkey_authentication(&passkeys)
        .map_err(|e| ApiError::BadRequest(format!("starting authentication: {e}")))?;
    let flow_id = state.flows.insert_authentication(auth_state);
    Ok(Json(json!({ "flowId": flow_id, "options": challenge })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginVerifyBody {
    pub flow_id: Uuid,
    pub credential: PublicKeyCredential,
}

/// POST /auth/login/verify — public. Sets the session cookie on success;
/// failures count against the presented credential id.
pub async fn login_verify(
    State(state): State<AppState>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<LoginVerifyBody>,
) -> Result<Response, ApiError> {
    let presented_id =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body.credential.raw_id.as_ref());
    if let Some(remaining) = state.lockouts.is_locked(&presented_id) {
        return Err(ApiError::LockedOut { retry_after_secs: remaining.as_secs().max(1) });
    }

    let auth_state = state
        .flows
        .take_authentication(&body.flow_id)
        .ok_or_else(|| ApiError::BadRequest("unknown or expired login flow".into()))?;

    let host = required_host(&headers)?;
    let webauthn = build_webauthn(host, tls)?;
    let result = match webauthn.finish_passkey_authentication(&body.credential, &auth_state) {
        Ok(result) => result,
        Err(e) => {
            info!(credential = %presented_id, error = %e, "login failed");
            if let Some(lockout) = state.lockouts.record_failure(&presented_id) {
                return Err(ApiError::LockedOut { retry_after_secs: lockout.as_secs().max(1) });
            }
            return Err(ApiError::Unauthenticated);
        }
    };

    let cred_id = credential_id_string(result.cred_id());
    let Some(record) = state.store.get_credential(&cred_id) else {
        // Credential revoked while the ceremony was in flight.
        return Err(ApiError::Unauthenticated);
    };
    state.lockouts.record_success(&presented_id);

    // Persist the moved signature counter and the lastUsedAt bump.
    let mut passkey: Passkey = serde_json::from_value(record.passkey)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("decoding stored passkey: {e}")))?;
    let _ = passkey.update_credential(&result);
    let passkey_value = serde_json::to_value(&passkey)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("encoding passkey: {e}")))?;
    state.store.credential_used(&cred_id, passkey_value)?;

    let session = state.store.create_session(&cred_id)?;
    info!(credential = %cred_id, "login ok");
    let jar = jar.add(session_cookie(session.token, tls));
    let body = Json(json!({ "verified": true, "csrfToken": session.csrf_token }));
    Ok((jar, body).into_response())
}

/// POST /auth/logout — protected. Invalidates the session, leaves the
/// credential intact.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let jar = match jar.get(SESSION_COOKIE) {
        Some(cookie) => {
            let _ = state.store.delete_session(cookie.value());
            jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/").build())
        }
        None => jar,
    };
    Ok((jar, Json(json!({ "ok": true }))).into_response())
}

// ---- credentials ----

pub async fn list_credentials(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "credentials": state.store.list_credentials() }))
}

/// DELETE /api/credentials/{id} — protected. Deleting the last credential is
/// only allowed from localhost; the store closes all bound sockets via its
/// revocation event.
pub async fn delete_credential(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthCtx>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_credential(&id, ctx.tier.is_local())?;
    info!(credential = %id, "credential deleted");
    Ok(Json(json!({ "ok": true })))
}

// ---- setup tokens ----

pub async fn list_tokens(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "tokens": state.store.list_setup_tokens() }))
}

#[derive(Deserialize)]
pub struct CreateTokenBody {
    pub name: String,
}

/// POST /api/tokens — protected. The token value appears in this response
/// and never again.
pub async fn create_token(
    State(state): State<AppState>,
    Json(body): Json<CreateTokenBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.store.add_setup_token(&body.name)?;
    Ok(Json(json!({
        "id": record.id,
        "token": record.token,
        "name": record.name,
        "createdAt": record.created_at,
    })))
}

#[derive(Deserialize)]
pub struct RenameTokenBody {
    pub name: String,
}

pub async fn rename_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameTokenBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.store.rename_setup_token(&id, &body.name)?;
    Ok(Json(json!({ "token": view })))
}

pub async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.revoke_setup_token(&id)?;
    Ok(Json(json!({ "ok": true })))
}

// ---- pairing ----

/// POST /auth/pair/start — protected. Mints a 30-second (code, PIN) pair and
/// the URL the second device should open.
pub async fn pair_start(
    State(state): State<AppState>,
    Extension(ListenerTls(tls)): Extension<ListenerTls>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let host = required_host(&headers)?;
    let (code, pin, ttl) = state.pairing.start();
    let scheme = if tls { "https" } else { "http" };
    let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
    Ok(Json(json!({
        "code": code,
        "pin": pin,
        "url": format!("{scheme}://{host}/pair?code={code}"),
        "expiresAt": expires_at,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairVerifyBody {
    pub code: Uuid,
    pub pin: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// POST /auth/pair/verify — public. Constant-time PIN check; failures feed
/// the lockout keyed on the code. Success mints the one-shot setup token the
/// device uses for its WebAuthn registration.
pub async fn pair_verify(
    State(state): State<AppState>,
    Json(body): Json<PairVerifyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lockout_key = format!("pair:{}", body.code);
    if let Some(remaining) = state.lockouts.is_locked(&lockout_key) {
        return Err(ApiError::LockedOut { retry_after_secs: remaining.as_secs().max(1) });
    }
    if state.pairing.verify(&body.code, &body.pin).is_err() {
        if let Some(lockout) = state.lockouts.record_failure(&lockout_key) {
            return Err(ApiError::LockedOut { retry_after_secs: lockout.as_secs().max(1) });
        }
        return Err(ApiError::BadRequest("invalid pairing code or pin".into()));
    }
    state.lockouts.record_success(&lockout_key);

    let name = body.device_name.unwrap_or_else(|| "Paired device".into());
    let token = state.store.add_setup_token(&name)?;
    info!(code = %body.code, "pairing verified");
    Ok(Json(json!({ "ok": true, "setupToken": token.token })))
}

/// GET /auth/pair/status/{code} — public polling endpoint for the device
/// that started the pairing.
pub async fn pair_status(
    State(state): State<AppState>,
    Path(code): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.pairing.status(&code) {
        Some(consumed) => Ok(Json(json!({ "consumed": consumed }))),
        None => Err(ApiError::NotFound),
    }
}

// ---- helpers ----

fn stored_passkeys(state: &AppState) -> Vec<Passkey> {
    state
        .store
        .credential_passkeys()
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

/// SETUP_TOKEN from the environment doubles as a non-consumable setup token,
/// compared in constant time.
fn peek_env_setup_token(state: &AppState, presented: &str) -> bool {
    state
        .cfg
        .setup_token_env
        .as_deref()
        .map(|expected| constant_time_eq(presented, expected))
        .unwrap_or(false)
}
