//! Signing-key lifecycle, JWT operations, PKCE, and DPoP proof checking.

pub mod dpop;
pub mod jwt;
pub mod keys;
pub mod pkce;

pub use dpop::{verify_proof, DpopError, DpopProof};
pub use jwt::{
    peek_claims, token_hash, verify_with_jwks, verify_with_jwks_expired_ok, AccessClaims,
    Confirmation, IdClaims, JwtError, RefreshClaims,
};
pub use keys::{
    decoding_key_for, Jwk, JwkSet, KeyError, KeyManager, KeyPolicy, KeyStatus, SigningAlgorithm,
};
pub use pkce::CodeChallengeMethod;
