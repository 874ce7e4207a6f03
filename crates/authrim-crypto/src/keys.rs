//! Signing-key lifecycle.
//!
//! One `KeyManager` actor per tenant owns the ordered key set and the
//! active-key pointer. Exactly one key is active at a time; retired keys
//! stay in the published JWKS for verification until their retention window
//! lapses, and emergency rotation marks every other key compromised so
//! in-flight tokens fail verification explicitly rather than silently.

use authrim_store::{Actor, ActorContext, Sweep};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;
const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("no active signing key")]
    NoActiveKey,
    #[error("unknown kid: {0}")]
    UnknownKid(String),
    #[error("token encoding failed: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("storage error: {0}")]
    Storage(#[from] authrim_store::StorageError),
    #[error("state decode failed: {0}")]
    StateDecode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    RS256,
    ES256,
}

impl SigningAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RS256" => Some(Self::RS256),
            "ES256" => Some(Self::ES256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
        }
    }

    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            Self::RS256 => Algorithm::RS256,
            Self::ES256 => Algorithm::ES256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    Active,
    Retired,
    Compromised,
}

/// RFC 7517 JSON Web Key, public half only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// Build a verification key from a published JWK.
pub fn decoding_key_for(jwk: &Jwk) -> Result<DecodingKey, KeyError> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or(KeyError::NoActiveKey)?;
            let e = jwk.e.as_deref().ok_or(KeyError::NoActiveKey)?;
            Ok(DecodingKey::from_rsa_components(n, e)?)
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or(KeyError::NoActiveKey)?;
            let y = jwk.y.as_deref().ok_or(KeyError::NoActiveKey)?;
            Ok(DecodingKey::from_ec_components(x, y)?)
        }
        other => Err(KeyError::StateDecode(format!("unsupported kty {other}"))),
    }
}

/// Lifecycle knobs, carried by callers from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub algorithm: SigningAlgorithm,
    pub rotation_interval_days: u32,
    pub retention_days: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            algorithm: SigningAlgorithm::RS256,
            rotation_interval_days: 30,
            retention_days: 7,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SigningKeyRecord {
    kid: String,
    algorithm: SigningAlgorithm,
    /// PKCS#8 PEM (RS256) or base64 PKCS#8 DER (ES256).
    private_material: String,
    public_jwk: Jwk,
    created_at: DateTime<Utc>,
    status: KeyStatus,
    retired_at: Option<DateTime<Utc>>,
}

impl SigningKeyRecord {
    fn encoding_key(&self) -> Result<EncodingKey, KeyError> {
        match self.algorithm {
            SigningAlgorithm::RS256 => {
                Ok(EncodingKey::from_rsa_pem(self.private_material.as_bytes())?)
            }
            SigningAlgorithm::ES256 => {
                let der = STANDARD
                    .decode(&self.private_material)
                    .map_err(|e| KeyError::StateDecode(e.to_string()))?;
                Ok(EncodingKey::from_ec_der(&der))
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KeyManagerState {
    version: u32,
    keys: Vec<SigningKeyRecord>,
    active_kid: Option<String>,
    last_rotation: DateTime<Utc>,
    policy: KeyPolicy,
}

pub struct KeyManager {
    ctx: ActorContext,
    state: Option<KeyManagerState>,
}

impl Actor for KeyManager {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl KeyManager {
    /// Idempotent load; generates the tenant's first key when none exists.
    pub async fn ensure_ready(&mut self, policy: &KeyPolicy) -> Result<(), KeyError> {
        if let Some(state) = self.state.as_mut() {
            state.policy = policy.clone();
            return Ok(());
        }
        match self.ctx.read(STATE_KEY).await? {
            Some(blob) => {
                let mut state: KeyManagerState = serde_json::from_slice(&blob)
                    .map_err(|e| KeyError::StateDecode(e.to_string()))?;
                state.policy = policy.clone();
                self.state = Some(state);
            }
            None => {
                let now = Utc::now();
                let record = generate_record(policy.algorithm, now)?;
                let state = KeyManagerState {
                    version: STATE_VERSION,
                    active_kid: Some(record.kid.clone()),
                    keys: vec![record],
                    last_rotation: now,
                    policy: policy.clone(),
                };
                self.state = Some(state);
                self.persist().await?;
            }
        }
        Ok(())
    }

    /// Sign a claim set with the active key. Returns `(jws, kid)`.
    pub async fn sign<T: Serialize>(
        &mut self,
        policy: &KeyPolicy,
        claims: &T,
    ) -> Result<(String, String), KeyError> {
        self.ensure_ready(policy).await?;
        let record = self.active_record()?;
        let mut header = Header::new(record.algorithm.jwt_algorithm());
        header.kid = Some(record.kid.clone());
        let encoding_key = record.encoding_key()?;
        let jws = jsonwebtoken::encode(&header, claims, &encoding_key)?;
        Ok((jws, record.kid.clone()))
    }

    pub async fn active_public_jwk(&mut self, policy: &KeyPolicy) -> Result<Jwk, KeyError> {
        self.ensure_ready(policy).await?;
        Ok(self.active_record()?.public_jwk.clone())
    }

    /// The published key set: the active key plus every retained key,
    /// compromised ones included.
    pub async fn jwks(&mut self, policy: &KeyPolicy) -> Result<JwkSet, KeyError> {
        self.ensure_ready(policy).await?;
        let state = self.state.as_ref().expect("ensured");
        Ok(JwkSet {
            keys: state.keys.iter().map(|k| k.public_jwk.clone()).collect(),
        })
    }

    /// Keys the core itself accepts for verification: active + retired,
    /// never compromised.
    pub async fn verification_jwks(&mut self, policy: &KeyPolicy) -> Result<JwkSet, KeyError> {
        self.ensure_ready(policy).await?;
        let state = self.state.as_ref().expect("ensured");
        Ok(JwkSet {
            keys: state
                .keys
                .iter()
                .filter(|k| k.status != KeyStatus::Compromised)
                .map(|k| k.public_jwk.clone())
                .collect(),
        })
    }

    /// Generate a new key pair and make it active. The new key is persisted
    /// together with the demotion of the old one, so a crash between the
    /// two cannot leave the tenant without an active key.
    pub async fn rotate(&mut self, policy: &KeyPolicy, now: DateTime<Utc>) -> Result<String, KeyError> {
        self.ensure_ready(policy).await?;
        let record = generate_record(self.state.as_ref().expect("ensured").policy.algorithm, now)?;
        let kid = record.kid.clone();
        {
            let state = self.state.as_mut().expect("ensured");
            for key in state.keys.iter_mut() {
                if key.status == KeyStatus::Active {
                    key.status = KeyStatus::Retired;
                    key.retired_at = Some(now);
                }
            }
            state.keys.push(record);
            state.active_kid = Some(kid.clone());
            state.last_rotation = now;
        }
        self.persist().await?;
        tracing::info!(kid = %kid, "signing key rotated");
        Ok(kid)
    }

    /// Rotate immediately and mark every other key compromised. They stay
    /// in the published JWKS but are refused for verification.
    pub async fn rotate_emergency(
        &mut self,
        policy: &KeyPolicy,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<String, KeyError> {
        self.ensure_ready(policy).await?;
        let record = generate_record(self.state.as_ref().expect("ensured").policy.algorithm, now)?;
        let kid = record.kid.clone();
        {
            let state = self.state.as_mut().expect("ensured");
            for key in state.keys.iter_mut() {
                key.status = KeyStatus::Compromised;
                key.retired_at = Some(now);
            }
            state.keys.push(record);
            state.active_kid = Some(kid.clone());
            state.last_rotation = now;
        }
        self.persist().await?;
        tracing::warn!(kid = %kid, reason, "emergency key rotation");
        Ok(kid)
    }

    fn active_record(&self) -> Result<&SigningKeyRecord, KeyError> {
        let state = self.state.as_ref().ok_or(KeyError::NoActiveKey)?;
        let kid = state.active_kid.as_deref().ok_or(KeyError::NoActiveKey)?;
        state
            .keys
            .iter()
            .find(|k| k.kid == kid && k.status == KeyStatus::Active)
            .ok_or(KeyError::NoActiveKey)
    }

    async fn persist(&mut self) -> Result<(), KeyError> {
        let blob = serde_json::to_vec(self.state.as_ref().expect("state present"))
            .map_err(|e| KeyError::StateDecode(e.to_string()))?;
        if let Err(err) = self.ctx.write(STATE_KEY, blob).await {
            // Roll back to the last durable snapshot.
            self.state = None;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sweep for KeyManager {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Some(state) = self.state.as_mut() else {
            return 0;
        };
        let policy = state.policy.clone();
        let retention = Duration::days(i64::from(policy.retention_days));
        let before = state.keys.len();
        let active_kid = state.active_kid.clone();
        state.keys.retain(|k| {
            if Some(&k.kid) == active_kid.as_ref() {
                return true;
            }
            match k.retired_at {
                Some(retired_at) => retired_at + retention > now,
                None => true,
            }
        });
        let removed = before - state.keys.len();

        let rotation_due =
            state.last_rotation + Duration::days(i64::from(policy.rotation_interval_days)) <= now;
        if rotation_due {
            if let Err(err) = self.rotate(&policy, now).await {
                tracing::error!(error = %err, "scheduled key rotation failed");
            }
        } else if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "key sweep persist failed");
            }
        }
        removed
    }
}

fn generate_record(
    algorithm: SigningAlgorithm,
    now: DateTime<Utc>,
) -> Result<SigningKeyRecord, KeyError> {
    let kid = Uuid::new_v4().to_string();
    let (private_material, public_jwk) = match algorithm {
        SigningAlgorithm::RS256 => {
            let mut rng = rand::thread_rng();
            let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::Generation(e.to_string()))?
                .to_string();
            let jwk = Jwk {
                kty: "RSA".to_string(),
                use_: "sig".to_string(),
                alg: "RS256".to_string(),
                kid: kid.clone(),
                n: Some(URL_SAFE_NO_PAD.encode(private.n().to_bytes_be())),
                e: Some(URL_SAFE_NO_PAD.encode(private.e().to_bytes_be())),
                crv: None,
                x: None,
                y: None,
            };
            (pem, jwk)
        }
        SigningAlgorithm::ES256 => {
            let rng = SystemRandom::new();
            let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            let pair =
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref(), &rng)
                    .map_err(|e| KeyError::Generation(e.to_string()))?;
            // Uncompressed point: 0x04 || x || y.
            let public = pair.public_key().as_ref();
            let jwk = Jwk {
                kty: "EC".to_string(),
                use_: "sig".to_string(),
                alg: "ES256".to_string(),
                kid: kid.clone(),
                n: None,
                e: None,
                crv: Some("P-256".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(&public[1..33])),
                y: Some(URL_SAFE_NO_PAD.encode(&public[33..65])),
            };
            (STANDARD.encode(document.as_ref()), jwk)
        }
    };
    Ok(SigningKeyRecord {
        kid,
        algorithm,
        private_material,
        public_jwk,
        created_at: now,
        status: KeyStatus::Active,
        retired_at: None,
    })
}
