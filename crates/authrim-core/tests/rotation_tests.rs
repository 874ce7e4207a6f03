//! Refresh-token family rotation and theft-detection behaviour.

use authrim_core::models::TokenFamily;
use authrim_core::stores::{NewFamily, RefreshRotator, RotateRequest};
use authrim_core::StoreError;
use authrim_store::{router, ActorHost, MemoryStorage};
use std::sync::Arc;

fn new_family(jti: &str) -> NewFamily {
    NewFamily {
        user_id: "u1".to_string(),
        client_id: "c1".to_string(),
        allowed_scope: "openid profile offline_access".to_string(),
        initial_jti: jti.to_string(),
        session_id: "3_session_s".to_string(),
        auth_time: chrono::Utc::now(),
        generation: 1,
        shard: 3,
        ttl_sec: 3600,
    }
}

fn rotate_request(jti: &str, version: Option<u64>) -> RotateRequest {
    RotateRequest {
        current_jti: jti.to_string(),
        presented_version: version,
        requested_scope: None,
    }
}

async fn rotator() -> tokio::sync::OwnedMutexGuard<RefreshRotator> {
    let host = ActorHost::<RefreshRotator>::new(Arc::new(MemoryStorage::new()));
    host.lease("tenant:t:refresh:c1:v1:shard-3").await
}

#[tokio::test]
async fn rotation_is_a_pure_successor() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    let family = rotator.create_family(new_family(&initial)).await.unwrap();
    assert_eq!(family.version, 0);

    let outcome = rotator
        .rotate(rotate_request(&initial, Some(0)))
        .await
        .unwrap();
    assert_eq!(outcome.version, 1);
    assert_ne!(outcome.new_jti, initial);
    // The successor keeps the family's pinned generation and shard.
    assert_eq!(router::parse_refresh_jti(&outcome.new_jti), Some((1, 3)));

    // Only the successor may rotate next.
    let next = rotator
        .rotate(rotate_request(&outcome.new_jti, Some(1)))
        .await
        .unwrap();
    assert_eq!(next.version, 2);
}

#[tokio::test]
async fn superseded_jti_revokes_the_whole_family() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    let family = rotator.create_family(new_family(&initial)).await.unwrap();

    let rotated = rotator
        .rotate(rotate_request(&initial, Some(0)))
        .await
        .unwrap();

    // Presenting the superseded token is theft.
    let err = rotator
        .rotate(rotate_request(&initial, Some(0)))
        .await
        .unwrap_err();
    match err {
        StoreError::TokenTheft {
            family_id,
            user_id,
            session_id,
            revoked_jtis,
        } => {
            assert_eq!(family_id, family.id);
            assert_eq!(user_id, "u1");
            assert_eq!(session_id, "3_session_s");
            // Both the current and the superseded jti come back for
            // blacklisting.
            assert!(revoked_jtis.contains(&rotated.new_jti));
            assert!(revoked_jtis.contains(&initial));
        }
        other => panic!("expected theft, got {other:?}"),
    }

    // The family is gone: even the legitimate current token is now dead.
    let err = rotator
        .rotate(rotate_request(&rotated.new_jti, Some(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidGrant { .. }));
    assert!(rotator.family_info(&family.id).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_version_on_current_jti_is_theft() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    rotator.create_family(new_family(&initial)).await.unwrap();

    let a = rotator.rotate(rotate_request(&initial, Some(0))).await.unwrap();
    let b = rotator
        .rotate(rotate_request(&a.new_jti, Some(1)))
        .await
        .unwrap();

    // Current jti, but the presented token claims an older rtv.
    let err = rotator
        .rotate(rotate_request(&b.new_jti, Some(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenTheft { .. }));
}

#[tokio::test]
async fn version_is_strictly_monotone() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    rotator.create_family(new_family(&initial)).await.unwrap();

    let mut jti = initial;
    let mut last_version = 0u64;
    for expected in 1..=10u64 {
        let outcome = rotator
            .rotate(rotate_request(&jti, Some(last_version)))
            .await
            .unwrap();
        assert_eq!(outcome.version, expected);
        assert!(outcome.version > last_version);
        last_version = outcome.version;
        jti = outcome.new_jti;
    }
}

#[tokio::test]
async fn scope_may_narrow_but_never_widen() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    rotator.create_family(new_family(&initial)).await.unwrap();

    let narrowed = rotator
        .rotate(RotateRequest {
            current_jti: initial,
            presented_version: Some(0),
            requested_scope: Some("openid".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(narrowed.scope, "openid");

    let err = rotator
        .rotate(RotateRequest {
            current_jti: narrowed.new_jti,
            presented_version: Some(1),
            requested_scope: Some("openid admin".to_string()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ScopeWidening { .. }));
}

#[tokio::test]
async fn revoke_family_reports_live_jtis() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    let family = rotator.create_family(new_family(&initial)).await.unwrap();
    let rotated = rotator
        .rotate(rotate_request(&initial, Some(0)))
        .await
        .unwrap();

    let jtis = rotator.revoke_family(&family.id, "logout").await.unwrap();
    assert!(jtis.contains(&rotated.new_jti));
    assert!(jtis.contains(&initial));

    // Revoking again is a quiet no-op.
    assert!(rotator.revoke_family(&family.id, "logout").await.unwrap().is_empty());
}

#[tokio::test]
async fn revoke_families_for_narrows_by_session() {
    let mut rotator = rotator().await;
    let a = router::new_refresh_jti(1, 3);
    let b = router::new_refresh_jti(1, 3);
    rotator.create_family(new_family(&a)).await.unwrap();
    let mut other = new_family(&b);
    other.session_id = "3_session_other".to_string();
    rotator.create_family(other).await.unwrap();

    let revoked = rotator
        .revoke_families_for("u1", Some("3_session_s"), "logout")
        .await
        .unwrap();
    assert_eq!(revoked.len(), 1);
    // The other session's family survives.
    assert!(rotator.family_for_jti(&b).await.unwrap().is_some());
}

#[tokio::test]
async fn previous_jti_memory_is_bounded() {
    let mut rotator = rotator().await;
    let initial = router::new_refresh_jti(1, 3);
    let family = rotator.create_family(new_family(&initial)).await.unwrap();

    let mut jti = initial;
    for v in 0..12u64 {
        let outcome = rotator.rotate(rotate_request(&jti, Some(v))).await.unwrap();
        jti = outcome.new_jti;
    }
    let info: TokenFamily = rotator.family_info(&family.id).await.unwrap().unwrap();
    assert!(info.previous_jtis.len() <= 5);
    assert_eq!(info.version, 12);
}

#[tokio::test]
async fn unknown_jti_is_invalid_grant_not_theft() {
    let mut rotator = rotator().await;
    let err = rotator
        .rotate(rotate_request("v1_3_neverissued", None))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidGrant { .. }));
}

#[tokio::test]
async fn state_survives_restart() {
    let storage: Arc<dyn authrim_store::Storage> = Arc::new(MemoryStorage::new());
    let initial = router::new_refresh_jti(1, 3);
    {
        let host = ActorHost::<RefreshRotator>::new(storage.clone());
        let mut rotator = host.lease("tenant:t:refresh:c1:v1:shard-3").await;
        rotator.create_family(new_family(&initial)).await.unwrap();
    }
    let host = ActorHost::<RefreshRotator>::new(storage);
    let mut rotator = host.lease("tenant:t:refresh:c1:v1:shard-3").await;
    let outcome = rotator
        .rotate(rotate_request(&initial, Some(0)))
        .await
        .unwrap();
    assert_eq!(outcome.version, 1);
}
