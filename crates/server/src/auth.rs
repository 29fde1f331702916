//! Bearer-token identity for the page API: HS256 JWTs with a `uid` claim and
//! a 24-hour validity window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("jwt secret is empty")]
    EmptySecret,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    uid: String,
    iat: i64,
    exp: i64,
}

fn sign(secret: &str, signing_input: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::EmptySecret)?;
    mac.update(signing_input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Issues a token for the union identifier, valid for 24 hours.
pub fn issue(secret: &str, user_id: &str) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::EmptySecret);
    }
    let now = Utc::now();
    let claims = Claims {
        uid: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
    };

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?);
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &signing_input)?);
    Ok(format!("{signing_input}.{signature}"))
}

/// Validates a token and returns the `uid` claim.
pub fn validate(secret: &str, token: &str) -> Result<String, AuthError> {
    if secret.is_empty() || token.is_empty() {
        return Err(AuthError::Malformed);
    }
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };

    let presented =
        URL_SAFE_NO_PAD.decode(signature).map_err(|_| AuthError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::EmptySecret)?;
    mac.update(format!("{header}.{payload}").as_bytes());
    mac.verify_slice(&presented).map_err(|_| AuthError::BadSignature)?;

    let claims: Claims = serde_json::from_slice(
        &URL_SAFE_NO_PAD.decode(payload).map_err(|_| AuthError::Malformed)?,
    )
    .map_err(|_| AuthError::Malformed)?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims.uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "a-test-secret-at-least-16-bytes";

    #[test]
    fn issued_token_round_trips() {
        let token = issue(SECRET, "ou_union_123").expect("issue");
        assert_eq!(validate(SECRET, &token).expect("validate"), "ou_union_123");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(SECRET, "ou_union_123").expect("issue");
        assert_eq!(
            validate("another-secret-16-bytes-long", &token),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = issue(SECRET, "ou_union_123").expect("issue");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            br#"{"uid":"someone_else","iat":0,"exp":99999999999}"#,
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert_eq!(validate(SECRET, &forged_token), Err(AuthError::BadSignature));
    }

    #[test]
    fn expired_token_is_rejected() {
        // Forge an already-expired token with a valid signature.
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = Claims { uid: "ou_union_123".to_string(), iat: 0, exp: 1 };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let signing_input = format!("{header}.{payload}");
        let signature = URL_SAFE_NO_PAD.encode(sign(SECRET, &signing_input).unwrap());
        let token = format!("{signing_input}.{signature}");

        assert_eq!(validate(SECRET, &token), Err(AuthError::Expired));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(validate(SECRET, "only.two"), Err(AuthError::Malformed));
        assert_eq!(validate(SECRET, ""), Err(AuthError::Malformed));
        assert_eq!(validate("", "a.b.c"), Err(AuthError::Malformed));
    }
}
