//! Security-event audit pipeline.
//!
//! Events are handed to a bounded channel and written by a background
//! worker with exponential backoff, so the reply path never waits on the
//! audit sink. Events that exhaust their retries land in a dead-letter
//! queue for operator recovery instead of disappearing.

use async_trait::async_trait;
use authrim_core::resilience::retry::{retry, RetryConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened. Consistency violations are the interesting ones, being
/// the triggers for cascade revocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    CodeIssued,
    CodeConsumed,
    CodeReplayDetected,
    FamilyCreated,
    TokenRotated,
    TokenTheftDetected,
    FamilyRevoked,
    SessionCreated,
    SessionRevoked,
    KeyRotated,
    EmergencyKeyRotation,
    ShardConfigChanged,
    DpopReplayDetected,
    RateLimitExceeded,
    ClientRegistered,
    LogoutCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub tenant: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub resource: Option<String>,
    pub ip_address: Option<String>,
    pub detail: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, tenant: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            tenant: tenant.into(),
            user_id: None,
            client_id: None,
            resource: None,
            ip_address: None,
            detail: serde_json::json!({}),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Where events ultimately land (relational store, SIEM shipper, ...).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: &SecurityEvent) -> Result<(), String>;
}

/// Sink that emits under the `audit` tracing target so events can be
/// routed separately from application logs.
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn write(&self, event: &SecurityEvent) -> Result<(), String> {
        tracing::info!(
            target: "audit",
            event_id = %event.id,
            kind = ?event.kind,
            tenant = %event.tenant,
            user_id = ?event.user_id,
            client_id = ?event.client_id,
            resource = ?event.resource,
            payload = %serde_json::to_string(event).unwrap_or_default(),
            "SECURITY_EVENT"
        );
        Ok(())
    }
}

/// Handle given to request handlers. `emit` enqueues and returns
/// immediately; a full buffer drops to a warning rather than blocking.
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<SecurityEvent>,
}

impl AuditLogger {
    pub fn emit(&self, event: SecurityEvent) {
        if let Err(err) = self.sender.try_send(event) {
            warn!(error = %err, "audit buffer full, event dropped to process log");
        }
    }
}

/// Background worker: drains the channel, writes with backoff, dead-letters
/// on persistent failure.
pub struct AuditWorker {
    receiver: mpsc::Receiver<SecurityEvent>,
    sink: Arc<dyn AuditSink>,
    dead_letter: Arc<Mutex<VecDeque<SecurityEvent>>>,
    retry_config: RetryConfig,
}

impl AuditWorker {
    /// Returns the handler-facing logger, the worker, and the shared
    /// dead-letter queue.
    pub fn channel(
        buffer: usize,
        sink: Arc<dyn AuditSink>,
    ) -> (AuditLogger, AuditWorker, Arc<Mutex<VecDeque<SecurityEvent>>>) {
        let (tx, rx) = mpsc::channel(buffer);
        let dead_letter = Arc::new(Mutex::new(VecDeque::new()));
        (
            AuditLogger { sender: tx },
            AuditWorker {
                receiver: rx,
                sink,
                dead_letter: dead_letter.clone(),
                retry_config: RetryConfig::default(),
            },
            dead_letter,
        )
    }

    pub async fn run(mut self) {
        info!("audit worker started");
        while let Some(event) = self.receiver.recv().await {
            let sink = self.sink.clone();
            let outcome = retry(self.retry_config, || {
                let sink = sink.clone();
                let event = event.clone();
                async move { sink.write(&event).await }
            })
            .await;
            if let Err(err) = outcome {
                error!(event_id = %event.id, error = %err, "audit write exhausted retries, dead-lettering");
                self.dead_letter.lock().expect("dead letter lock").push_back(event);
            }
        }
        info!("audit worker stopped");
    }
}
