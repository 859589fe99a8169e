//! Activation token issuance/validation and bearer JWTs.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::utils::{generate_token, hash_token};

pub(crate) const JWT_ISSUER: &str = "elevategs";
pub(crate) const JWT_TTL_SECONDS: i64 = 2 * 60 * 60;
pub(crate) const JWT_REMEMBER_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// A freshly issued one-time token. The raw value goes into the email link;
/// only the hash and expiry are stored.
pub(super) struct IssuedToken {
    pub(super) raw: String,
    pub(super) hash: Vec<u8>,
    pub(super) expires_at: DateTime<Utc>,
}

pub(super) fn issue_token(ttl_seconds: i64) -> Result<IssuedToken> {
    let raw = generate_token()?;
    let hash = hash_token(&raw);
    Ok(IssuedToken {
        raw,
        hash,
        expires_at: Utc::now() + Duration::seconds(ttl_seconds),
    })
}

/// Check a presented activation token against the stored hash and expiry.
///
/// Fails closed: an absent hash or expiry never validates, and a past expiry
/// rejects even a correct token.
pub(super) fn validate_activation_token(
    stored_hash: Option<&[u8]>,
    stored_expires_at: Option<DateTime<Utc>>,
    candidate: &str,
) -> bool {
    let (Some(hash), Some(expires_at)) = (stored_hash, stored_expires_at) else {
        return false;
    };
    if expires_at <= Utc::now() {
        return false;
    }
    hash == hash_token(candidate).as_slice()
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub(crate) sub: Uuid,
    pub(crate) role: String,
    pub(crate) iss: String,
    pub(crate) iat: i64,
    pub(crate) exp: i64,
}

/// Sign an HS256 bearer token for the user. Returns the token and its TTL so
/// login responses can report `expires_in`.
pub(crate) fn mint_jwt(
    secret: &SecretString,
    user_id: Uuid,
    role: &str,
    remember: bool,
) -> Result<(String, i64)> {
    let ttl = if remember {
        JWT_REMEMBER_TTL_SECONDS
    } else {
        JWT_TTL_SECONDS
    };
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        iss: JWT_ISSUER.to_string(),
        iat: now,
        exp: now + ttl,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .context("failed to sign bearer token")?;
    Ok((token, ttl))
}

/// Verify signature, expiry, and issuer. Any failure yields `None`; callers
/// fall through to the 401 path without leaking the reason.
pub(crate) fn verify_jwt(secret: &SecretString, token: &str) -> Option<Claims> {
    let mut validation = Validation::default();
    validation.set_issuer(&[JWT_ISSUER]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::from("test-secret")
    }

    #[test]
    fn issued_token_hash_matches_raw() {
        let issued = issue_token(60).unwrap();
        assert!(validate_activation_token(
            Some(&issued.hash),
            Some(issued.expires_at),
            &issued.raw,
        ));
    }

    #[test]
    fn wrong_candidate_rejected() {
        let issued = issue_token(60).unwrap();
        assert!(!validate_activation_token(
            Some(&issued.hash),
            Some(issued.expires_at),
            "some-other-token",
        ));
    }

    #[test]
    fn expired_token_rejected_even_when_correct() {
        let issued = issue_token(-1).unwrap();
        assert!(!validate_activation_token(
            Some(&issued.hash),
            Some(issued.expires_at),
            &issued.raw,
        ));
    }

    #[test]
    fn absent_fields_fail_closed() {
        let issued = issue_token(60).unwrap();
        assert!(!validate_activation_token(
            None,
            Some(issued.expires_at),
            &issued.raw
        ));
        assert!(!validate_activation_token(
            Some(&issued.hash),
            None,
            &issued.raw
        ));
        assert!(!validate_activation_token(None, None, &issued.raw));
    }

    #[test]
    fn reissue_invalidates_prior_token() {
        let first = issue_token(60).unwrap();
        let second = issue_token(60).unwrap();
        // The stored hash is now the second token's; the first no longer validates.
        assert!(!validate_activation_token(
            Some(&second.hash),
            Some(second.expires_at),
            &first.raw,
        ));
        assert!(validate_activation_token(
            Some(&second.hash),
            Some(second.expires_at),
            &second.raw,
        ));
    }

    #[test]
    fn jwt_round_trip() {
        let user_id = Uuid::new_v4();
        let (token, ttl) = mint_jwt(&secret(), user_id, "teacher", false).unwrap();
        assert_eq!(ttl, JWT_TTL_SECONDS);

        let claims = verify_jwt(&secret(), &token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.role, "teacher");
        assert_eq!(claims.iss, JWT_ISSUER);
        assert_eq!(claims.exp - claims.iat, JWT_TTL_SECONDS);
    }

    #[test]
    fn remember_extends_ttl() {
        let (_, ttl) = mint_jwt(&secret(), Uuid::new_v4(), "student", true).unwrap();
        assert_eq!(ttl, JWT_REMEMBER_TTL_SECONDS);
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let (token, _) = mint_jwt(&secret(), Uuid::new_v4(), "student", false).unwrap();
        assert!(verify_jwt(&SecretString::from("other-secret"), &token).is_none());
    }

    #[test]
    fn jwt_rejects_garbage() {
        assert!(verify_jwt(&secret(), "not-a-jwt").is_none());
    }
}
