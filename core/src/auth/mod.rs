//! Auth store and credential lockout. The store exclusively owns everything
//! persisted under the data dir; the relay holds lookups (tokens, credential
//! ids), never ownership.

pub mod lockout;
pub mod store;

pub use lockout::Lockouts;
pub use store::{
    AuthEvent, AuthStore, CredentialRecord, CredentialView, InstanceConfig, SessionRecord,
    SessionView, SetupTokenRecord, SetupTokenView, UserRecord,
};

/// Failure taxonomy for every auth operation. The relay maps these onto HTTP
/// statuses and WebSocket close codes.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("locked out")]
    LockedOut { retry_after_secs: u64 },
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("auth store error: {0}")]
    Internal(String),
}

impl AuthError {
    pub(crate) fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        AuthError::Internal(format!("{context}: {err}"))
    }
}
