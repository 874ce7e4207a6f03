//! Core entities owned by the state-store actors.

pub mod auth_code;
pub mod challenge;
pub mod ciba;
pub mod device;
pub mod revocation;
pub mod session;
pub mod shard_config;
pub mod token_family;

pub use auth_code::{AuthCodeRecord, DerivedFamilyRef};
pub use challenge::{Challenge, ChallengeKind};
pub use ciba::{CibaDecision, CibaRequest};
pub use device::{DeviceAuthorization, DeviceDecision};
pub use revocation::RevokedToken;
pub use session::{Session, SessionData};
pub use shard_config::{ShardConfig, ShardGeneration};
pub use token_family::TokenFamily;
