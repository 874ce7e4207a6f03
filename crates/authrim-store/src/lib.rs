//! Actor-storage kernel and shard routing.
//!
//! Every stateful component of the core runs as a named single-writer
//! actor with a durable key-value store behind it. This crate provides the
//! storage contract, the per-name serialization host, and the deterministic
//! routing that picks an instance name for every request.

pub mod actor;
pub mod router;
pub mod storage;

pub use actor::{Actor, ActorContext, ActorHost, Sweep};
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
