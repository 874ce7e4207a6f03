//! Domain models and state-store actors for the authorization core.
//!
//! Everything stateful lives behind a named actor from `authrim-store`;
//! protocol handlers in `authrim-api` resolve instances by name per request
//! and hold no state of their own.

pub mod error;
pub mod models;
pub mod resilience;
pub mod stores;

pub use error::StoreError;
