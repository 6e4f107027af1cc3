//! WebAuthn ceremony plumbing. The relying party is derived from the request
//! Host so the same instance works as `localhost`, a `.local` name, or a
//! public hostname. In-flight ceremony states live in a TTL map keyed by a
//! server-issued flow id that the verify call must echo; taking a flow
//! consumes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use webauthn_rs::prelude::*;

use crate::access::strip_port;
use crate::error::ApiError;

const FLOW_TTL: Duration = Duration::from_secs(5 * 60);

pub const RP_NAME: &str = "Katulong";

/// What a completed registration is allowed to do, decided at options time.
pub struct RegistrationGrant {
    /// Setup token to consume inside the store's critical section; None for
    /// localhost registrations.
    pub setup_token: Option<String>,
}

struct PendingRegistration {
    state: PasskeyRegistration,
    grant: RegistrationGrant,
    expires_at: Instant,
}

struct PendingAuthentication {
    state: PasskeyAuthentication,
    expires_at: Instant,
}

#[derive(Default)]
pub struct WebauthnFlows {
    reg: Mutex<HashMap<Uuid, PendingRegistration>>,
    auth: Mutex<HashMap<Uuid, PendingAuthentication>>,
}

impl WebauthnFlows {
    pub fn insert_registration(&self, state: PasskeyRegistration, grant: RegistrationGrant) -> Uuid {
        let flow_id = Uuid::new_v4();
        let mut reg = self.reg.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        reg.retain(|_, p| p.expires_at > now);
        reg.insert(flow_id, PendingRegistration { state, grant, expires_at: now + FLOW_TTL });
        flow_id
    }

    pub fn take_registration(&self, flow_id: &Uuid) -> Option<(PasskeyRegistration, RegistrationGrant)> {
        let mut reg = self.reg.lock().unwrap_or_else(|e| e.into_inner());
        let pending = reg.remove(flow_id)?;
        if pending.expires_at <= Instant::now() {
            return None;
        }
        Some((pending.state, pending.grant))
    }

    pub fn insert_authentication(&self, state: PasskeyAuthentication) -> Uuid {
        let flow_id = Uuid::new_v4();
        let mut auth = self.auth.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        auth.retain(|_, p| p.expires_at > now);
        auth.insert(flow_id, PendingAuthentication { state, expires_at: now + FLOW_TTL });
        flow_id
    }

    pub fn take_authentication(&self, flow_id: &Uuid) -> Option<PasskeyAuthentication> {
        let mut auth = self.auth.lock().unwrap_or_else(|e| e.into_inner());
        let pending = auth.remove(flow_id)?;
        if pending.expires_at <= Instant::now() {
            return None;
        }
        Some(pending.state)
    }
}

/// Build the relying party for this request. The rp id is the bare hostname;
/// the origin carries the scheme and port the client actually used.
pub fn build_webauthn(host: &str, tls: bool) -> Result<Webauthn, ApiError> {
    let rp_id = strip_port(host);
    if rp_id.is_empty() {
        return Err(ApiError::BadRequest("missing host header".into()));
    }
    let scheme = if tls { "https" } else { "http" };
    let origin = Url::parse(&format!("{scheme}://{host}"))
        .map_err(|e| ApiError::BadRequest(format!("invalid host header: {e}")))?;
    WebauthnBuilder::new(rp_id, &origin)
        .and_then(|b| b.rp_name(RP_NAME).build())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("building webauthn context: {e}")))
}

/// Stable string form of a credential id: base64url without padding, same as
/// the WebAuthn JSON encoding, so the browser and the store agree on ids.
pub fn credential_id_string(id: &CredentialID) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(id.as_ref())
}
