//! Bearer-key guard for the `/v1` routes.

use axum::http::{header, HeaderMap};

use crate::error::ProxyError;

/// Check the `Authorization: Bearer <key>` header against `keys`.
///
/// An empty key list leaves the API open.
pub fn verify_bearer(headers: &HeaderMap, keys: &[String]) -> Result<(), ProxyError> {
    if keys.is_empty() {
        return Ok(());
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(token) = token else {
        return Err(ProxyError::Unauthorized);
    };
    // Compare against every key so timing doesn't reveal which one matched.
    let matched = keys
        .iter()
        .fold(false, |found, key| constant_time_eq(token, key) | found);
    if matched {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a_bytes.iter().zip(b_bytes) {
        diff |= x ^ y;
    }
    diff == 0
}
