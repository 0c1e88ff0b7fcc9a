// Token claim decoding
// Only the time-limited claims are read; the signature is the backend's business

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

/// Time-limited claims carried by an access token
#[derive(Debug, Deserialize)]
struct TimeClaims {
    exp: Option<i64>,
}

/// Decode the `exp` claim of a signed token.
///
/// Returns `None` when the token is not a decodable JWT or has no `exp`.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<TimeClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data
            .claims
            .exp
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0)),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to decode token claims");
            None
        }
    }
}

/// Mint an HS256 token expiring `expires_in` seconds from now
#[cfg(test)]
pub(crate) fn test_token(expires_in: Option<i64>) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = match expires_in {
        Some(secs) => serde_json::json!({
            "sub": "learner-1",
            "exp": Utc::now().timestamp() + secs,
        }),
        None => serde_json::json!({ "sub": "learner-1" }),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}
