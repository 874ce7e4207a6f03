//! DPoP proof verification (RFC 9449).
//!
//! A proof is a JWT carried in the `DPoP` header, signed by the client's
//! possession key which travels in the proof's own `jwk` header. The jti
//! replay window is enforced by the caller through the DPoP-jti store; this
//! module checks everything else and derives the RFC 7638 thumbprint used
//! for `cnf.jkt` binding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk as HeaderJwk};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const DPOP_TYP: &str = "dpop+jwt";
/// Acceptable clock offset for the proof's `iat`, in seconds.
const IAT_WINDOW_SEC: i64 = 300;

#[derive(Debug, Error)]
pub enum DpopError {
    #[error("malformed DPoP proof")]
    Malformed,
    #[error("DPoP proof rejected: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

/// A verified proof. `jkt` is the thumbprint to embed as `cnf.jkt`.
#[derive(Debug, Clone)]
pub struct DpopProof {
    pub jti: String,
    pub jkt: String,
}

/// Verify a proof against the request it accompanies. `access_token` is
/// required once the client presents a DPoP-bound token (the `ath` check).
pub fn verify_proof(
    proof: &str,
    http_method: &str,
    http_uri: &str,
    now_unix: i64,
    access_token: Option<&str>,
) -> Result<DpopProof, DpopError> {
    let header = decode_header(proof).map_err(|_| DpopError::Malformed)?;

    if header.typ.as_deref() != Some(DPOP_TYP) {
        return Err(DpopError::Invalid {
            reason: "typ must be dpop+jwt".to_string(),
        });
    }
    if !matches!(header.alg, Algorithm::ES256 | Algorithm::RS256) {
        return Err(DpopError::Invalid {
            reason: "unsupported proof algorithm".to_string(),
        });
    }
    let jwk = header.jwk.as_ref().ok_or(DpopError::Invalid {
        reason: "proof header carries no jwk".to_string(),
    })?;

    let key = DecodingKey::from_jwk(jwk).map_err(|_| DpopError::Malformed)?;
    let mut validation = Validation::new(header.alg);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let claims = decode::<ProofClaims>(proof, &key, &validation)
        .map_err(|_| DpopError::Malformed)?
        .claims;

    if !claims.htm.eq_ignore_ascii_case(http_method) {
        return Err(DpopError::Invalid {
            reason: format!("htm mismatch: {}", claims.htm),
        });
    }
    if normalize_htu(&claims.htu) != normalize_htu(http_uri) {
        return Err(DpopError::Invalid {
            reason: format!("htu mismatch: {}", claims.htu),
        });
    }
    if (now_unix - claims.iat).abs() > IAT_WINDOW_SEC {
        return Err(DpopError::Invalid {
            reason: "iat outside acceptance window".to_string(),
        });
    }
    if let Some(token) = access_token {
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()));
        if claims.ath.as_deref() != Some(expected.as_str()) {
            return Err(DpopError::Invalid {
                reason: "ath does not match presented access token".to_string(),
            });
        }
    }

    Ok(DpopProof {
        jti: claims.jti,
        jkt: thumbprint(jwk)?,
    })
}

/// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the required
/// members in lexicographic order.
pub fn thumbprint(jwk: &HeaderJwk) -> Result<String, DpopError> {
    let canonical = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => {
            let crv = match params.curve {
                EllipticCurve::P256 => "P-256",
                EllipticCurve::P384 => "P-384",
                EllipticCurve::P521 => "P-521",
                _ => {
                    return Err(DpopError::Invalid {
                        reason: "unsupported curve".to_string(),
                    })
                }
            };
            format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                crv, params.x, params.y
            )
        }
        AlgorithmParameters::RSA(params) => {
            format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, params.e, params.n)
        }
        _ => {
            return Err(DpopError::Invalid {
                reason: "unsupported proof key type".to_string(),
            })
        }
    };
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

/// htu comparison ignores query and fragment (RFC 9449 §4.3).
fn normalize_htu(uri: &str) -> &str {
    let uri = uri.split('#').next().unwrap_or(uri);
    uri.split('?').next().unwrap_or(uri).trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

    fn test_keypair() -> (EncodingKey, HeaderJwk) {
        let rng = SystemRandom::new();
        let document =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref(), &rng)
                .unwrap();
        let public = pair.public_key().as_ref();
        let jwk_json = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&public[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&public[33..65]),
        });
        let jwk: HeaderJwk = serde_json::from_value(jwk_json).unwrap();
        (EncodingKey::from_ec_der(document.as_ref()), jwk)
    }

    fn make_proof(
        key: &EncodingKey,
        jwk: &HeaderJwk,
        htm: &str,
        htu: &str,
        iat: i64,
        jti: &str,
    ) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(DPOP_TYP.to_string());
        header.jwk = Some(jwk.clone());
        let claims = ProofClaims {
            jti: jti.to_string(),
            htm: htm.to_string(),
            htu: htu.to_string(),
            iat,
            ath: None,
        };
        encode(&header, &claims, key).unwrap()
    }

    #[test]
    fn valid_proof_verifies_and_yields_stable_jkt() {
        let (key, jwk) = test_keypair();
        let now = 1_700_000_000;
        let proof = make_proof(&key, &jwk, "POST", "https://op.example/token", now, "j1");
        let verified =
            verify_proof(&proof, "POST", "https://op.example/token", now, None).unwrap();
        assert_eq!(verified.jti, "j1");
        assert_eq!(verified.jkt, thumbprint(&jwk).unwrap());
    }

    #[test]
    fn method_and_uri_must_match() {
        let (key, jwk) = test_keypair();
        let now = 1_700_000_000;
        let proof = make_proof(&key, &jwk, "POST", "https://op.example/token", now, "j1");
        assert!(verify_proof(&proof, "GET", "https://op.example/token", now, None).is_err());
        assert!(verify_proof(&proof, "POST", "https://op.example/other", now, None).is_err());
        // Query strings are ignored for htu comparison.
        assert!(
            verify_proof(&proof, "POST", "https://op.example/token?x=1", now, None).is_ok()
        );
    }

    #[test]
    fn stale_iat_is_rejected() {
        let (key, jwk) = test_keypair();
        let now = 1_700_000_000;
        let proof = make_proof(&key, &jwk, "POST", "https://op.example/token", now - 900, "j1");
        assert!(verify_proof(&proof, "POST", "https://op.example/token", now, None).is_err());
    }

    #[test]
    fn missing_typ_is_rejected() {
        let (key, jwk) = test_keypair();
        let mut header = Header::new(Algorithm::ES256);
        header.jwk = Some(jwk);
        let claims = ProofClaims {
            jti: "j1".to_string(),
            htm: "POST".to_string(),
            htu: "https://op.example/token".to_string(),
            iat: 1_700_000_000,
            ath: None,
        };
        let proof = encode(&header, &claims, &key).unwrap();
        assert!(matches!(
            verify_proof(&proof, "POST", "https://op.example/token", 1_700_000_000, None),
            Err(DpopError::Invalid { .. })
        ));
    }
}
