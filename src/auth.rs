//! API key check for the authenticated endpoints.
//!
//! Clients send `Authorization: Bearer <key>`. The key must be one of the
//! keys listed in `API_KEYS`. With no keys configured every request is
//! refused.

use axum::http::{header, HeaderMap};
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header must be 'Bearer <key>'")]
    Malformed,
    #[error("invalid API key")]
    InvalidKey,
    #[error("no API keys are configured on this server")]
    NoKeysConfigured,
}

/// Extract the bearer token from the headers.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token.trim())
}

/// Check the request headers against the configured keys.
pub fn authorize(headers: &HeaderMap, keys: &[String]) -> Result<(), AuthError> {
    if keys.is_empty() {
        return Err(AuthError::NoKeysConfigured);
    }
    let token = bearer_token(headers)?;
    // Every key is compared; the results are folded without branching.
    let matched = keys.iter().fold(Choice::from(0u8), |found, key| {
        found | key.as_bytes().ct_eq(token.as_bytes())
    });
    if bool::from(matched) {
        Ok(())
    } else {
        Err(AuthError::InvalidKey)
    }
}
