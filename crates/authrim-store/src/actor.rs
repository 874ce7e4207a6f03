//! Single-writer actor hosting.
//!
//! An actor instance is addressed by name. The host guarantees at most one
//! live instance per name and serializes all operations on it through a fair
//! mutex, so callers observe run-to-completion semantics in arrival order.
//! Instances load their state lazily from storage and are expected to
//! persist after every mutation.

use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Handle an actor uses to reach its own durable namespace.
#[derive(Clone)]
pub struct ActorContext {
    name: String,
    storage: Arc<dyn Storage>,
}

impl ActorContext {
    pub fn new(name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage.get(&self.name, key).await
    }

    pub async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.storage.put(&self.name, key, value).await
    }

    pub async fn write_all(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        self.storage.put_all(&self.name, entries).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.storage.delete(&self.name, key).await
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.storage.list_prefix(&self.name, prefix).await
    }
}

/// A stateful component hosted one-per-name.
pub trait Actor: Send + 'static {
    fn attach(ctx: ActorContext) -> Self;
}

/// Periodic expiry sweep, driven by the host's alarm task.
///
/// Implementations remove entries past their TTL and persist; persistence
/// failures are logged inside the actor and retried on the next alarm.
#[async_trait]
pub trait Sweep {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize;
}

/// Resolves instance names to live actors, creating them on first use.
pub struct ActorHost<A: Actor> {
    storage: Arc<dyn Storage>,
    cells: DashMap<String, Arc<Mutex<A>>>,
}

impl<A: Actor> ActorHost<A> {
    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cells: DashMap::new(),
        })
    }

    /// Acquire the named instance for exclusive use. The returned guard
    /// serializes every operation on this instance; the tokio mutex is
    /// fair, so operations run in arrival order.
    pub async fn lease(&self, name: &str) -> OwnedMutexGuard<A> {
        let cell = self
            .cells
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(A::attach(ActorContext::new(
                    name,
                    self.storage.clone(),
                ))))
            })
            .clone();
        cell.lock_owned().await
    }

    /// Names of every instance this host has materialized.
    pub fn instantiated(&self) -> Vec<String> {
        self.cells.iter().map(|e| e.key().clone()).collect()
    }
}

impl<A: Actor + Sweep> ActorHost<A> {
    /// Spawn the hourly-style expiry alarm over all live instances.
    pub fn spawn_sweeper(host: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let host = Arc::clone(host);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly started
            // hosts do not sweep before serving anything.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for name in host.instantiated() {
                    let mut actor = host.lease(&name).await;
                    let removed = actor.sweep(Utc::now()).await;
                    drop(actor);
                    if removed > 0 {
                        debug!(instance = %name, removed, "expiry sweep");
                    }
                }
            }
        })
    }
}
