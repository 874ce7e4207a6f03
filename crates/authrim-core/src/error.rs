//! Error taxonomy for the state-store layer.
//!
//! Consistency errors (`CodeReplay`, `TokenTheft`) are security events: the
//! failing call still answers `invalid_grant` at the protocol edge, but
//! carries enough context for the handler to fire the cascade revocation.

use authrim_store::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid grant: {reason}")]
    InvalidGrant { reason: String },

    /// A consumed authorization code was presented again. Carries the
    /// routing refs of every refresh family minted from that code so the
    /// caller can revoke them all.
    #[error("authorization code replay detected")]
    CodeReplay {
        derived_families: Vec<crate::models::DerivedFamilyRef>,
    },

    /// A superseded refresh token was presented. The family is already
    /// revoked by the time this error is returned; the payload lets the
    /// caller blacklist its jtis and tear down the session it belonged to.
    #[error("refresh token reuse detected, family {family_id} revoked")]
    TokenTheft {
        family_id: String,
        user_id: String,
        session_id: String,
        revoked_jtis: Vec<String>,
    },

    #[error("requested scope exceeds the family grant: {requested}")]
    ScopeWidening { requested: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state decode failed: {0}")]
    StateDecode(String),

    /// An invariant the store must uphold was observed broken. The
    /// operation fails closed; the actor state is not corrupted further.
    #[error("invariant violation: {message}")]
    Invariant { message: String },
}

impl StoreError {
    pub fn invalid_grant(reason: impl Into<String>) -> Self {
        StoreError::InvalidGrant {
            reason: reason.into(),
        }
    }

    /// Whether this is a consistency error that must fan out a cascade.
    pub fn is_security_event(&self) -> bool {
        matches!(self, StoreError::CodeReplay { .. } | StoreError::TokenTheft { .. })
    }
}
