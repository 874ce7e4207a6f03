//! Deterministic shard routing and identifier formats.
//!
//! Routing is purely functional: a request's instance name is computed from
//! `(tenant, kind, key material, generation, shard count)` and nothing else.
//! Already-issued artifacts embed their `(generation, shard)` at creation,
//! so a shard-count change only ever affects newly created artifacts;
//! nothing is rebalanced.

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a, used for lower-stakes routing (sessions, codes, rate counters).
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// SHA-256 truncated to its first 4 bytes, used for refresh-family routing.
pub fn sha256_prefix_u32(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn session_shard_for_user(user_id: &str, shard_count: u32) -> u32 {
    fnv1a_32(user_id.as_bytes()) % shard_count.max(1)
}

pub fn refresh_shard_for(user_id: &str, client_id: &str, shard_count: u32) -> u32 {
    let key_material = format!("{}:{}", user_id, client_id);
    sha256_prefix_u32(key_material.as_bytes()) % shard_count.max(1)
}

pub fn rate_shard_for_ip(client_ip: &str, shard_count: u32) -> u32 {
    fnv1a_32(client_ip.as_bytes()) % shard_count.max(1)
}

// ---------------------------------------------------------------------------
// Instance names
// ---------------------------------------------------------------------------

pub fn session_instance(tenant: &str, shard: u32) -> String {
    format!("tenant:{}:session:shard-{}", tenant, shard)
}

pub fn auth_code_instance(tenant: &str) -> String {
    format!("tenant:{}:code", tenant)
}

/// Refresh rotator instances are scoped per client and pinned to the
/// generation current at family creation.
pub fn refresh_instance(tenant: &str, client_id: &str, generation: u32, shard: u32) -> String {
    format!(
        "tenant:{}:refresh:{}:v{}:shard-{}",
        tenant, client_id, generation, shard
    )
}

/// Backward-compatible name for jtis issued before generations existed.
pub fn legacy_refresh_instance(tenant: &str, client_id: &str) -> String {
    format!("tenant:{}:refresh:{}", tenant, client_id)
}

pub fn key_manager_instance(tenant: &str) -> String {
    format!("tenant:{}:keys", tenant)
}

pub fn challenge_instance(tenant: &str) -> String {
    format!("tenant:{}:challenge", tenant)
}

pub fn dpop_jti_instance(tenant: &str) -> String {
    format!("tenant:{}:dpop-jti", tenant)
}

pub fn revocation_instance(tenant: &str) -> String {
    format!("tenant:{}:revocation", tenant)
}

pub fn rate_counter_instance(tenant: &str, shard: u32) -> String {
    format!("tenant:{}:rate:shard-{}", tenant, shard)
}

pub fn device_code_instance(tenant: &str) -> String {
    format!("tenant:{}:device", tenant)
}

pub fn ciba_instance(tenant: &str) -> String {
    format!("tenant:{}:ciba", tenant)
}

pub fn shard_config_instance(tenant: &str) -> String {
    format!("tenant:{}:shard-config", tenant)
}

// ---------------------------------------------------------------------------
// Identifier formats (bit-stable, see also the parsing section)
// ---------------------------------------------------------------------------

const BASE64_URL: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// URL-safe random string from the platform CSPRNG.
pub fn random_token(len: usize) -> String {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).expect("system RNG unavailable");
    bytes
        .iter()
        .map(|b| BASE64_URL[(*b & 0x3f) as usize] as char)
        .collect()
}

/// `{shard}_session_{uuid-v4}`
pub fn new_session_id(shard: u32) -> String {
    format!("{}_session_{}", shard, Uuid::new_v4())
}

/// `v{generation}_{shard}_{random}`
pub fn new_refresh_jti(generation: u32, shard: u32) -> String {
    format!("v{}_{}_{}", generation, shard, random_token(32))
}

/// `{shard}_{random}`. The shard prefix is advisory for codes; the store
/// is tenant-scoped either way.
pub fn new_auth_code(shard: u32) -> String {
    format!("{}_{}", shard, random_token(40))
}

pub fn new_par_request_uri() -> String {
    format!("urn:ietf:params:oauth:request_uri:{}", random_token(32))
}

// ---------------------------------------------------------------------------
// Identifier parsing
// ---------------------------------------------------------------------------

/// Extract `(generation, shard)` from a `v{gen}_{shard}_…` jti. Anything
/// else (including legacy `rt_{uuid}` tokens) is treated as generation 0.
pub fn parse_refresh_jti(jti: &str) -> Option<(u32, u32)> {
    let rest = jti.strip_prefix('v')?;
    let mut parts = rest.splitn(3, '_');
    let generation = parts.next()?.parse().ok()?;
    let shard = parts.next()?.parse().ok()?;
    let random = parts.next()?;
    if random.is_empty() {
        return None;
    }
    Some((generation, shard))
}

/// Resolve the rotator instance owning a presented jti. Legacy jtis route
/// to the suffix-less generation-0 instance.
pub fn refresh_instance_for_jti(tenant: &str, client_id: &str, jti: &str) -> String {
    match parse_refresh_jti(jti) {
        Some((generation, shard)) => refresh_instance(tenant, client_id, generation, shard),
        None => legacy_refresh_instance(tenant, client_id),
    }
}

/// Extract the shard prefix from a `{shard}_session_{uuid}` id. The prefix
/// is authoritative: sessions created before a re-shard keep routing to
/// their original instance.
pub fn parse_session_shard(session_id: &str) -> Option<u32> {
    let mut parts = session_id.splitn(3, '_');
    let shard = parts.next()?.parse().ok()?;
    if parts.next()? != "session" {
        return None;
    }
    parts.next()?;
    Some(shard)
}

pub fn session_instance_for_id(tenant: &str, session_id: &str) -> Option<String> {
    parse_session_shard(session_id).map(|shard| session_instance(tenant, shard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Published FNV-1a 32-bit vectors.
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn refresh_jti_round_trip() {
        let jti = new_refresh_jti(3, 7);
        assert_eq!(parse_refresh_jti(&jti), Some((3, 7)));
    }

    #[test]
    fn legacy_jti_is_generation_zero() {
        assert_eq!(parse_refresh_jti("rt_550e8400-e29b-41d4-a716-446655440000"), None);
        assert_eq!(
            refresh_instance_for_jti("t1", "c1", "rt_550e8400-e29b-41d4-a716-446655440000"),
            "tenant:t1:refresh:c1"
        );
    }

    #[test]
    fn malformed_prefixes_fall_back_to_legacy() {
        assert_eq!(parse_refresh_jti("vx_1_abc"), None);
        assert_eq!(parse_refresh_jti("v1_y_abc"), None);
        assert_eq!(parse_refresh_jti("v1_2"), None);
        assert_eq!(parse_refresh_jti("v1_2_"), None);
    }

    #[test]
    fn session_id_round_trip() {
        let id = new_session_id(7);
        assert_eq!(parse_session_shard(&id), Some(7));
        assert_eq!(
            session_instance_for_id("t1", &id).unwrap(),
            "tenant:t1:session:shard-7"
        );
        assert_eq!(parse_session_shard("notasession"), None);
        assert_eq!(parse_session_shard("7_sess_x"), None);
    }

    #[test]
    fn instance_name_shape() {
        assert_eq!(
            refresh_instance("acme", "web", 2, 5),
            "tenant:acme:refresh:web:v2:shard-5"
        );
    }

    proptest! {
        /// A shard-count change never affects the routing of an
        /// already-issued jti: the embedded (generation, shard) wins.
        #[test]
        fn issued_jti_routing_is_stable_across_resharding(
            generation in 0u32..100,
            old_count in 1u32..64,
            new_count in 1u32..64,
            user in "[a-z0-9-]{1,32}",
            client in "[a-z0-9-]{1,16}",
        ) {
            let shard = refresh_shard_for(&user, &client, old_count);
            let jti = new_refresh_jti(generation, shard);
            let before = refresh_instance_for_jti("t", &client, &jti);
            // Re-sharding changes only how *new* jtis pick a shard.
            let _ = refresh_shard_for(&user, &client, new_count);
            let after = refresh_instance_for_jti("t", &client, &jti);
            prop_assert_eq!(before, after);
        }

        #[test]
        fn shard_is_always_in_range(user in ".*", count in 1u32..256) {
            prop_assert!(session_shard_for_user(&user, count) < count);
        }
    }
}
