//! File-backed auth store: one JSON file per entity under the data dir,
//! written temp-file-then-rename, all mutations behind a single mutex because
//! the invariants span entities (deleting a credential purges its sessions).
//!
//! Layout: user.json, credentials/<id>.json, sessions/<token>.json,
//! setup-tokens/<id>.json, config.json. Files are 0600, directories 0700.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::AuthError;

/// Rolling session lifetime from creation.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const CREDENTIALS_DIR: &str = "credentials";
const SESSIONS_DIR: &str = "sessions";
const SETUP_TOKENS_DIR: &str = "setup-tokens";
const EVENT_CHANNEL_CAP: usize = 64;

/// Published when state changes in a way live connections must react to.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// All WS bound to this credential must close with 1008.
    CredentialDeleted { credential_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: uuid::Uuid,
    pub name: String,
}

/// A registered WebAuthn credential. The passkey blob (public key, signature
/// counter, transports) is stored as the relay's WebAuthn layer produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub passkey: serde_json::Value,
    #[serde(default)]
    pub device_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub transports: Vec<String>,
}

/// What credential listings expose; never the passkey material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialView {
    pub id: String,
    pub name: String,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub transports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token: String,
    pub credential_id: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub csrf_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub credential_id: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTokenRecord {
    pub id: String,
    pub token: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Listing view; the token value is returned exactly once, at creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTokenView {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub instance_name: String,
    #[serde(default)]
    pub instance_icon: Option<String>,
    #[serde(default)]
    pub toolbar_color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            instance_name: "Katulong".into(),
            instance_icon: None,
            toolbar_color: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Default)]
struct Inner {
    user: Option<UserRecord>,
    credentials: HashMap<String, CredentialRecord>,
    sessions: HashMap<String, SessionRecord>,
    setup_tokens: HashMap<String, SetupTokenRecord>,
    config: InstanceConfig,
}

pub struct AuthStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthStore {
    /// Load the store from disk, creating the directory layout on first run.
    pub fn open(dir: &Path) -> anyhow::Result<Arc<Self>> {
        create_dir_0700(dir)?;
        for sub in [CREDENTIALS_DIR, SESSIONS_DIR, SETUP_TOKENS_DIR, "tls", "uploads"] {
            create_dir_0700(&dir.join(sub))?;
        }

        let mut inner = Inner {
            user: read_json_opt(&dir.join("user.json")),
            config: read_json_opt(&dir.join("config.json")).unwrap_or_default(),
            ..Inner::default()
        };
        for rec in read_dir_json::<CredentialRecord>(&dir.join(CREDENTIALS_DIR)) {
            inner.credentials.insert(rec.id.clone(), rec);
        }
        for rec in read_dir_json::<SessionRecord>(&dir.join(SESSIONS_DIR)) {
            inner.sessions.insert(rec.token.clone(), rec);
        }
        for rec in read_dir_json::<SetupTokenRecord>(&dir.join(SETUP_TOKENS_DIR)) {
            inner.setup_tokens.insert(rec.id.clone(), rec);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Ok(Arc::new(Self { dir: dir.to_path_buf(), inner: Mutex::new(inner), events }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Setup is complete once at least one credential exists.
    pub fn is_setup(&self) -> bool {
        !self.lock().credentials.is_empty()
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.lock().user.clone()
    }

    // ---- setup tokens ----

    pub fn add_setup_token(&self, name: &str) -> Result<SetupTokenRecord, AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::BadRequest("token name is required".into()));
        }
        let record = SetupTokenRecord {
            id: uuid::Uuid::new_v4().to_string(),
            token: random_hex32(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let mut inner = self.lock();
        write_json_0600(&self.setup_token_path(&record.id), &record)
            .map_err(|e| AuthError::internal("writing setup token", e))?;
        inner.setup_tokens.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Atomic check-and-delete by token value.
    pub fn consume_setup_token(&self, token: &str) -> Result<SetupTokenRecord, AuthError> {
        let mut inner = self.lock();
        self.consume_setup_token_locked(&mut inner, token)
    }

    fn consume_setup_token_locked(
        &self,
        inner: &mut Inner,
        token: &str,
    ) -> Result<SetupTokenRecord, AuthError> {
        let id = inner
            .setup_tokens
            .values()
            .find(|t| t.token == token)
            .map(|t| t.id.clone())
            .ok_or(AuthError::NotFound)?;
        fs::remove_file(self.setup_token_path(&id))
            .map_err(|e| AuthError::internal("removing setup token", e))?;
        inner.setup_tokens.remove(&id).ok_or(AuthError::NotFound)
    }

    /// Check a setup token is still outstanding without consuming it.
    pub fn peek_setup_token(&self, token: &str) -> bool {
        self.lock().setup_tokens.values().any(|t| t.token == token)
    }

    pub fn revoke_setup_token(&self, id: &str) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if !inner.setup_tokens.contains_key(id) {
            return Err(AuthError::NotFound);
        }
        fs::remove_file(self.setup_token_path(id))
            .map_err(|e| AuthError::internal("removing setup token", e))?;
        inner.setup_tokens.remove(id);
        Ok(())
    }

    pub fn rename_setup_token(&self, id: &str, name: &str) -> Result<SetupTokenView, AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::BadRequest("token name is required".into()));
        }
        let mut inner = self.lock();
        let record = inner.setup_tokens.get_mut(id).ok_or(AuthError::NotFound)?;
        let mut updated = record.clone();
        updated.name = name.to_string();
        write_json_0600(&self.setup_token_path(id), &updated)
            .map_err(|e| AuthError::internal("writing setup token", e))?;
        *record = updated.clone();
        Ok(setup_token_view(&updated))
    }

    pub fn list_setup_tokens(&self) -> Vec<SetupTokenView> {
        let inner = self.lock();
        let mut list: Vec<_> = inner.setup_tokens.values().map(setup_token_view).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    // ---- credentials ----

    /// Append a credential. When a setup token string is given it is
    /// validated and deleted in the same critical section, so the token can
    /// never authorize two registrations.
    pub fn register_credential(
        &self,
        record: CredentialRecord,
        setup_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if inner.credentials.contains_key(&record.id) {
            return Err(AuthError::Conflict);
        }
        let token_id = match setup_token {
            Some(token) => Some(
                inner
                    .setup_tokens
                    .values()
                    .find(|t| t.token == token)
                    .map(|t| t.id.clone())
                    .ok_or_else(|| AuthError::BadRequest("invalid setup token".into()))?,
            ),
            None => None,
        };
        write_json_0600(&self.credential_path(&record.id), &record)
            .map_err(|e| AuthError::internal("writing credential", e))?;
        if let Some(token_id) = token_id {
            if let Err(e) = fs::remove_file(self.setup_token_path(&token_id)) {
                warn!(error = %e, "removing consumed setup token file");
            }
            inner.setup_tokens.remove(&token_id);
        }
        inner.credentials.insert(record.id.clone(), record);
        if inner.user.is_none() {
            let user = UserRecord {
                id: uuid::Uuid::new_v4(),
                name: whoami(),
            };
            write_json_0600(&self.dir.join("user.json"), &user)
                .map_err(|e| AuthError::internal("writing user", e))?;
            inner.user = Some(user);
        }
        Ok(())
    }

    /// Remove a credential and every session that references it, then tell
    /// the relay so live sockets get closed. Refuses to delete the last
    /// credential for a non-local caller: that would lock the owner out.
    pub fn delete_credential(&self, id: &str, local_caller: bool) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if !inner.credentials.contains_key(id) {
            return Err(AuthError::NotFound);
        }
        if inner.credentials.len() == 1 && !local_caller {
            return Err(AuthError::Forbidden);
        }
        fs::remove_file(self.credential_path(id))
            .map_err(|e| AuthError::internal("removing credential", e))?;
        inner.credentials.remove(id);

        let tokens: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.credential_id == id)
            .map(|s| s.token.clone())
            .collect();
        for token in tokens {
            if let Err(e) = fs::remove_file(self.session_path(&token)) {
                warn!(error = %e, "removing session file for deleted credential");
            }
            inner.sessions.remove(&token);
        }

        let _ = self.events.send(AuthEvent::CredentialDeleted { credential_id: id.to_string() });
        Ok(())
    }

    pub fn get_credential(&self, id: &str) -> Option<CredentialRecord> {
        self.lock().credentials.get(id).cloned()
    }

    pub fn credential_exists(&self, id: &str) -> bool {
        self.lock().credentials.contains_key(id)
    }

    pub fn list_credentials(&self) -> Vec<CredentialView> {
        let inner = self.lock();
        let mut list: Vec<_> = inner
            .credentials
            .values()
            .map(|c| CredentialView {
                id: c.id.clone(),
                name: c.name.clone(),
                device_id: c.device_id.clone(),
                created_at: c.created_at,
                last_used_at: c.last_used_at,
                user_agent: c.user_agent.clone(),
                transports: c.transports.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Raw passkey blobs for building the login challenge.
    pub fn credential_passkeys(&self) -> Vec<serde_json::Value> {
        self.lock().credentials.values().map(|c| c.passkey.clone()).collect()
    }

    /// After a successful login: bump lastUsedAt and store the updated
    /// passkey blob (the signature counter moved).
    pub fn credential_used(&self, id: &str, passkey: serde_json::Value) -> Result<(), AuthError> {
        let mut inner = self.lock();
        let record = inner.credentials.get_mut(id).ok_or(AuthError::NotFound)?;
        let mut updated = record.clone();
        updated.last_used_at = Utc::now();
        updated.passkey = passkey;
        write_json_0600(&self.credential_path(id), &updated)
            .map_err(|e| AuthError::internal("writing credential", e))?;
        *record = updated;
        Ok(())
    }

    // ---- sessions ----

    pub fn create_session(&self, credential_id: &str) -> Result<SessionRecord, AuthError> {
        let mut inner = self.lock();
        if !inner.credentials.contains_key(credential_id) {
            return Err(AuthError::NotFound);
        }
        let now = Utc::now();
        let record = SessionRecord {
            token: random_hex32(),
            credential_id: credential_id.to_string(),
            created_at: now,
            expiry: now + chrono::Duration::from_std(SESSION_TTL).unwrap_or(chrono::Duration::days(30)),
            last_activity_at: now,
            csrf_token: random_hex32(),
        };
        write_json_0600(&self.session_path(&record.token), &record)
            .map_err(|e| AuthError::internal("writing session", e))?;
        inner.sessions.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    /// A token is valid iff it exists, is unexpired, and its credential still
    /// exists. Expired or orphaned records are removed on sight.
    pub fn validate_session(&self, token: &str) -> Result<SessionRecord, AuthError> {
        let mut inner = self.lock();
        let Some(record) = inner.sessions.get(token).cloned() else {
            return Err(AuthError::Unauthenticated);
        };
        let now = Utc::now();
        if record.expiry <= now || !inner.credentials.contains_key(&record.credential_id) {
            let _ = fs::remove_file(self.session_path(token));
            inner.sessions.remove(token);
            return Err(AuthError::Unauthenticated);
        }
        let mut updated = record;
        updated.last_activity_at = now;
        if let Err(e) = write_json_0600(&self.session_path(token), &updated) {
            warn!(error = %e, "persisting session activity");
        }
        inner.sessions.insert(token.to_string(), updated.clone());
        Ok(updated)
    }

    /// Logout: drop the session, leave the credential intact.
    pub fn delete_session(&self, token: &str) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if inner.sessions.remove(token).is_none() {
            return Err(AuthError::NotFound);
        }
        fs::remove_file(self.session_path(token))
            .map_err(|e| AuthError::internal("removing session", e))?;
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        let mut inner = self.lock();
        // Opportunistic sweep of expired records.
        let now = Utc::now();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.expiry <= now)
            .map(|s| s.token.clone())
            .collect();
        for token in expired {
            let _ = fs::remove_file(self.session_path(&token));
            inner.sessions.remove(&token);
        }
        let mut list: Vec<_> = inner
            .sessions
            .values()
            .map(|s| SessionView {
                credential_id: s.credential_id.clone(),
                created_at: s.created_at,
                expiry: s.expiry,
                last_activity_at: s.last_activity_at,
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    // ---- instance config ----

    pub fn config(&self) -> InstanceConfig {
        self.lock().config.clone()
    }

    pub fn update_config(
        &self,
        mutate: impl FnOnce(&mut InstanceConfig),
    ) -> Result<InstanceConfig, AuthError> {
        let mut inner = self.lock();
        let mut updated = inner.config.clone();
        mutate(&mut updated);
        updated.updated_at = Utc::now();
        write_json_0600(&self.dir.join("config.json"), &updated)
            .map_err(|e| AuthError::internal("writing config", e))?;
        inner.config = updated.clone();
        Ok(updated)
    }

    // ---- paths ----

    fn credential_path(&self, id: &str) -> PathBuf {
        self.dir.join(CREDENTIALS_DIR).join(format!("{}.json", sanitize_file_stem(id)))
    }

    fn session_path(&self, token: &str) -> PathBuf {
        self.dir.join(SESSIONS_DIR).join(format!("{}.json", sanitize_file_stem(token)))
    }

    fn setup_token_path(&self, id: &str) -> PathBuf {
        self.dir.join(SETUP_TOKENS_DIR).join(format!("{}.json", sanitize_file_stem(id)))
    }
}

fn setup_token_view(t: &SetupTokenRecord) -> SetupTokenView {
    SetupTokenView { id: t.id.clone(), name: t.name.clone(), created_at: t.created_at }
}

/// Entity ids become file names; anything outside [A-Za-z0-9_-] is escaped so
/// an id can never traverse out of its directory.
fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn random_hex32() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "katulong".into())
}

fn create_dir_0700(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

/// Temp-file-then-rename with mode 0600, so a crash mid-write never leaves a
/// torn entity file and secrets are never world-readable.
fn write_json_0600<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn read_json_opt<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let data = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&data) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable entity file");
            None
        }
    }
}

fn read_dir_json<T: for<'de> Deserialize<'de>>(dir: &Path) -> Vec<T> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .filter_map(|p| read_json_opt(&p))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_credential(id: &str) -> CredentialRecord {
        let now = Utc::now();
        CredentialRecord {
            id: id.to_string(),
            passkey: serde_json::json!({"cred_id": id}),
            device_id: Some("device-1".into()),
            name: "laptop".into(),
            created_at: now,
            last_used_at: now,
            user_agent: Some("test".into()),
            transports: vec!["internal".into()],
        }
    }

    #[test]
    fn setup_token_is_consumed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        let tok = store.add_setup_token("phone").unwrap();
        assert!(store.peek_setup_token(&tok.token));

        let consumed = store.consume_setup_token(&tok.token).unwrap();
        assert_eq!(consumed.id, tok.id);
        assert!(matches!(store.consume_setup_token(&tok.token), Err(AuthError::NotFound)));
        assert!(store.list_setup_tokens().is_empty());
    }

    #[test]
    fn register_consumes_linked_token_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        let tok = store.add_setup_token("phone").unwrap();

        store.register_credential(test_credential("cred-a"), Some(&tok.token)).unwrap();
        assert!(store.is_setup());
        assert!(!store.peek_setup_token(&tok.token));

        // Second registration on the same token must fail before touching
        // the credential table.
        let err = store
            .register_credential(test_credential("cred-b"), Some(&tok.token))
            .unwrap_err();
        assert!(matches!(err, AuthError::BadRequest(_)));
        assert!(!store.credential_exists("cred-b"));
    }

    #[test]
    fn duplicate_credential_id_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("cred-a"), None).unwrap();
        assert!(matches!(
            store.register_credential(test_credential("cred-a"), None),
            Err(AuthError::Conflict)
        ));
    }

    #[test]
    fn delete_credential_purges_its_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("cred-a"), None).unwrap();
        store.register_credential(test_credential("cred-b"), None).unwrap();
        let sess_a = store.create_session("cred-a").unwrap();
        let sess_b = store.create_session("cred-b").unwrap();

        let mut events = store.subscribe();
        store.delete_credential("cred-a", false).unwrap();

        assert!(matches!(store.validate_session(&sess_a.token), Err(AuthError::Unauthenticated)));
        assert!(store.validate_session(&sess_b.token).is_ok());
        match events.try_recv().unwrap() {
            AuthEvent::CredentialDeleted { credential_id } => assert_eq!(credential_id, "cred-a"),
        }
        // No session on disk references the deleted credential.
        for s in store.list_sessions() {
            assert_ne!(s.credential_id, "cred-a");
        }
    }

    #[test]
    fn last_credential_is_protected_from_remote_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("only"), None).unwrap();

        assert!(matches!(store.delete_credential("only", false), Err(AuthError::Forbidden)));
        assert!(store.credential_exists("only"));
        store.delete_credential("only", true).unwrap();
        assert!(!store.is_setup());
    }

    #[test]
    fn session_requires_live_credential_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("cred-a"), None).unwrap();
        let sess = store.create_session("cred-a").unwrap();
        assert_eq!(sess.token.len(), 64);
        assert_eq!(sess.csrf_token.len(), 64);

        let validated = store.validate_session(&sess.token).unwrap();
        assert_eq!(validated.credential_id, "cred-a");
        assert!(validated.last_activity_at >= sess.last_activity_at);

        assert!(matches!(store.validate_session("no-such-token"), Err(AuthError::Unauthenticated)));

        // Force-expire the record; validation must remove it.
        {
            let mut inner = store.lock();
            let rec = inner.sessions.get_mut(&sess.token).unwrap();
            rec.expiry = Utc::now() - chrono::Duration::seconds(1);
        }
        assert!(matches!(store.validate_session(&sess.token), Err(AuthError::Unauthenticated)));
        assert!(store.lock().sessions.is_empty());
    }

    #[test]
    fn logout_leaves_the_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("cred-a"), None).unwrap();
        let sess = store.create_session("cred-a").unwrap();
        store.delete_session(&sess.token).unwrap();
        assert!(matches!(store.validate_session(&sess.token), Err(AuthError::Unauthenticated)));
        assert!(store.credential_exists("cred-a"));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token;
        {
            let store = AuthStore::open(dir.path()).unwrap();
            store.register_credential(test_credential("cred-a"), None).unwrap();
            token = store.create_session("cred-a").unwrap().token;
            store
                .update_config(|c| c.instance_name = "workbench".into())
                .unwrap();
        }
        let store = AuthStore::open(dir.path()).unwrap();
        assert!(store.is_setup());
        assert!(store.validate_session(&token).is_ok());
        assert_eq!(store.config().instance_name, "workbench");
        assert!(store.user().is_some());
    }

    #[test]
    fn entity_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::open(dir.path()).unwrap();
        store.register_credential(test_credential("cred-a"), None).unwrap();

        let cred_dir = dir.path().join(CREDENTIALS_DIR);
        let mode = fs::metadata(&cred_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let file = cred_dir.join("cred-a.json");
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
