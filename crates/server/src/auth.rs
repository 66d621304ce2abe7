//! Terminal access tokens.
//!
//! The bridge only asks "is this token valid right now". [`JwtValidator`]
//! answers that for HS256 JSON Web Tokens signed with a shared secret; an
//! `exp` claim is mandatory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Decides whether a presented token grants terminal access.
pub trait TokenValidator: Send + Sync {
    fn is_valid(&self, token: &str) -> bool;
}

impl<F> TokenValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, token: &str) -> bool {
        self(token)
    }
}

/// Reasons a token is rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("token is not a well-formed JWT")]
    Malformed,

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token signature does not match")]
    BadSignature,

    #[error("token has no exp claim")]
    MissingExpiry,

    #[error("token expired")]
    Expired,

    #[error("token not valid yet")]
    NotYetValid,

    #[error("invalid signing key")]
    InvalidKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Registered claims the validator looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// HS256 token validator.
#[derive(Clone)]
pub struct JwtValidator {
    secret: Vec<u8>,
    leeway: Duration,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("secret", &"<redacted>")
            .field("leeway", &self.leeway)
            .finish()
    }
}

impl JwtValidator {
    pub fn new(secret: impl Into<Vec<u8>>, leeway: Duration) -> Self {
        Self {
            secret: secret.into(),
            leeway,
        }
    }

    /// Verifies `token` against the current time.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_at(token, unix_now())
    }

    /// Verifies `token` as of `now` (seconds since the Unix epoch).
    pub fn validate_at(&self, token: &str, now: u64) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let header: Header = decode_segment(header)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        let signing_input = &token[..token.len() - signature_len(token)];
        self.mac(signing_input)?
            .verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(payload)?;
        let leeway = self.leeway.as_secs();

        let exp = claims.exp.ok_or(AuthError::MissingExpiry)?;
        if now > exp.saturating_add(leeway) {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(leeway) < nbf {
                return Err(AuthError::NotYetValid);
            }
        }

        Ok(claims)
    }

    /// Mints a token for `subject` that expires after `ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = Claims {
            sub: Some(subject.to_string()),
            exp: Some(now.saturating_add(ttl.as_secs())),
            nbf: None,
            iat: Some(now),
        };
        self.sign(&claims)
    }

    /// Signs arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = Header {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let signing_input = format!("{}.{}", encode_segment(&header)?, encode_segment(claims)?);
        let signature = self.mac(&signing_input)?.finalize().into_bytes();
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn mac(&self, signing_input: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidKey)?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }
}

impl TokenValidator for JwtValidator {
    fn is_valid(&self, token: &str) -> bool {
        match self.validate(token) {
            Ok(claims) => {
                tracing::debug!(subject = ?claims.sub, "Accepted token");
                true
            }
            Err(e) => {
                tracing::info!(error = %e, "Rejected token");
                false
            }
        }
    }
}

/// Length of the signature segment including its leading dot.
fn signature_len(token: &str) -> usize {
    token.rfind('.').map_or(0, |dot| token.len() - dot)
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, AuthError> {
    let json = serde_json::to_vec(value).map_err(|_| AuthError::Malformed)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn validator() -> JwtValidator {
        JwtValidator::new("test", Duration::from_secs(5))
    }

    fn token(claims: Claims) -> String {
        validator().sign(&claims).unwrap()
    }

    #[test]
    fn test_issued_token_is_valid() {
        let v = validator();
        let token = v.issue("dev", Duration::from_secs(60)).unwrap();

        let claims = v.validate(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("dev"));
        assert!(v.is_valid(&token));
    }

    #[test]
    fn test_expiry_with_leeway() {
        let t = token(Claims {
            exp: Some(NOW),
            ..Claims::default()
        });
        let v = validator();

        assert!(v.validate_at(&t, NOW).is_ok());
        assert!(v.validate_at(&t, NOW + 5).is_ok());
        assert_eq!(v.validate_at(&t, NOW + 6), Err(AuthError::Expired));
    }

    #[test]
    fn test_exp_is_required() {
        let t = token(Claims {
            sub: Some("dev".into()),
            ..Claims::default()
        });
        assert_eq!(validator().validate_at(&t, NOW), Err(AuthError::MissingExpiry));
    }

    #[test]
    fn test_not_before() {
        let t = token(Claims {
            exp: Some(NOW + 100),
            nbf: Some(NOW + 50),
            ..Claims::default()
        });
        let v = validator();

        assert_eq!(v.validate_at(&t, NOW), Err(AuthError::NotYetValid));
        assert!(v.validate_at(&t, NOW + 45).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let t = token(Claims {
            exp: Some(NOW + 100),
            ..Claims::default()
        });
        let other = JwtValidator::new("other", Duration::ZERO);
        assert_eq!(other.validate_at(&t, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let t = token(Claims {
            sub: Some("dev".into()),
            exp: Some(NOW + 100),
            ..Claims::default()
        });
        let forged = encode_segment(&Claims {
            sub: Some("admin".into()),
            exp: Some(NOW + 100),
            ..Claims::default()
        })
        .unwrap();

        let parts: Vec<&str> = t.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert_eq!(
            validator().validate_at(&tampered, NOW),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_none_algorithm_rejected() {
        let header = encode_segment(&Header {
            alg: "none".into(),
            typ: None,
        })
        .unwrap();
        let payload = encode_segment(&Claims {
            exp: Some(NOW + 100),
            ..Claims::default()
        })
        .unwrap();

        assert_eq!(
            validator().validate_at(&format!("{header}.{payload}."), NOW),
            Err(AuthError::UnsupportedAlgorithm("none".into()))
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let v = validator();
        for t in ["", "abc", "a.b", "a.b.c.d", "!!.??.**"] {
            assert_eq!(v.validate_at(t, NOW), Err(AuthError::Malformed), "{t:?}");
        }
        assert!(!v.is_valid("not-a-token"));
    }

    #[test]
    fn test_closure_validator() {
        let only_letmein = |token: &str| token == "letmein";
        assert!(only_letmein.is_valid("letmein"));
        assert!(!only_letmein.is_valid("nope"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let debug = format!("{:?}", validator());
        assert!(!debug.contains("test\""));
        assert!(debug.contains("redacted"));
    }
}
