//! State-store actors.
//!
//! Every store follows the same discipline: initialize-on-first-use from a
//! single `"state"` blob, validate → mutate in-memory → persist → reply,
//! and on a persistence failure drop the in-memory image so the next
//! operation reloads the last durable snapshot.

pub mod auth_code_store;
pub mod challenge_store;
pub mod ciba_store;
pub mod device_code_store;
pub mod dpop_jti_store;
pub mod rate_limiter;
pub mod refresh_rotator;
pub mod revocation_store;
pub mod session_store;
pub mod shard_config_store;

pub use auth_code_store::AuthCodeStore;
pub use challenge_store::ChallengeStore;
pub use ciba_store::{CibaPoll, CibaStore};
pub use device_code_store::{DeviceCodeStore, DevicePoll};
pub use dpop_jti_store::DpopJtiStore;
pub use rate_limiter::{RateCounterShard, RateDecision, RateLimitPolicy};
pub use refresh_rotator::{NewFamily, RefreshRotator, RotateRequest, RotationOutcome};
pub use revocation_store::RevocationStore;
pub use session_store::SessionShard;
pub use shard_config_store::ShardConfigStore;
