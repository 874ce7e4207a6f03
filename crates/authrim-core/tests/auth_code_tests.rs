//! Authorization-code single-use invariants under concurrency and storage
//! failure.

use async_trait::async_trait;
use authrim_core::models::AuthCodeRecord;
use authrim_core::stores::AuthCodeStore;
use authrim_core::StoreError;
use authrim_store::{ActorHost, MemoryStorage, Storage, StorageError};
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn record(code: &str) -> AuthCodeRecord {
    let now = Utc::now();
    AuthCodeRecord {
        code: code.to_string(),
        client_id: "c1".to_string(),
        redirect_uri: "https://rp/cb".to_string(),
        user_id: "u1".to_string(),
        scope: "openid".to_string(),
        code_challenge: None,
        code_challenge_method: None,
        nonce: None,
        state: None,
        session_id: "7_session_s".to_string(),
        auth_time: now,
        acr: None,
        amr: vec![],
        used: false,
        used_at: None,
        created_at: now,
        expires_at: now + Duration::seconds(60),
        derived_families: vec![],
    }
}

/// Storage wrapper that can be told to fail the next write.
struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            fail_writes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get(&self, actor: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(actor, key).await
    }

    async fn put(&self, actor: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        self.inner.put(actor, key, value).await
    }

    async fn put_all(
        &self,
        actor: &str,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        self.inner.put_all(actor, entries).await
    }

    async fn delete(&self, actor: &str, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(actor, key).await
    }

    async fn list_prefix(
        &self,
        actor: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.inner.list_prefix(actor, prefix).await
    }
}

#[tokio::test]
async fn concurrent_consumes_have_exactly_one_winner() {
    let host = ActorHost::<AuthCodeStore>::new(Arc::new(MemoryStorage::new()));
    {
        let mut store = host.lease("tenant:t:code").await;
        store.store(record("race-code")).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let host = host.clone();
        tasks.push(tokio::spawn(async move {
            let mut store = host.lease("tenant:t:code").await;
            store.consume("race-code", "c1", None).await
        }));
    }

    let mut successes = 0;
    let mut failures = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(StoreError::CodeReplay { .. }) | Err(StoreError::InvalidGrant { .. }) => {
                failures += 1
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one consume may succeed");
    assert_eq!(failures, 15);
}

#[tokio::test]
async fn failed_save_rolls_back_the_consume() {
    let storage = Arc::new(FlakyStorage::new());
    let host = ActorHost::<AuthCodeStore>::new(storage.clone());
    {
        let mut store = host.lease("tenant:t:code").await;
        store.store(record("abc")).await.unwrap();
    }

    storage.fail_writes.store(true, Ordering::SeqCst);
    {
        let mut store = host.lease("tenant:t:code").await;
        let err = store.consume("abc", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    // The mutation was not acknowledged, so after the backend recovers the
    // code must still be consumable exactly once.
    storage.fail_writes.store(false, Ordering::SeqCst);
    let mut store = host.lease("tenant:t:code").await;
    let consumed = store.consume("abc", "c1", None).await.unwrap();
    assert!(consumed.used);
    assert!(matches!(
        store.consume("abc", "c1", None).await.unwrap_err(),
        StoreError::CodeReplay { .. }
    ));
}

#[tokio::test]
async fn failed_save_rolls_back_the_store() {
    let storage = Arc::new(FlakyStorage::new());
    let host = ActorHost::<AuthCodeStore>::new(storage.clone());

    storage.fail_writes.store(true, Ordering::SeqCst);
    {
        let mut store = host.lease("tenant:t:code").await;
        assert!(store.store(record("abc")).await.is_err());
    }

    storage.fail_writes.store(false, Ordering::SeqCst);
    let mut store = host.lease("tenant:t:code").await;
    // The failed store left nothing behind; consuming is "unknown code".
    let err = store.consume("abc", "c1", None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidGrant { .. }));
    // And the id is free to be stored again.
    store.store(record("abc")).await.unwrap();
}
