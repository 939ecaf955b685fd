use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

pub fn verify_pyrus_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(expected) = compute_hmac_sha1_hex(secret, payload) else {
        return false;
    };
    let provided = normalize_signature(signature_header);
    if provided.is_empty() {
        return false;
    }
    constant_time_equals(&provided, &expected)
}

/// Checks an `Authorization` header value of the form `Bearer <token>`.
pub fn verify_bearer_token(expected: &str, authorization_header: &str) -> bool {
    let Some(provided) = authorization_header.trim().strip_prefix("Bearer ") else {
        return false;
    };
    let provided = provided.trim();
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    constant_time_equals(provided, expected)
}

pub fn compute_hmac_sha1_hex(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn normalize_signature(raw: &str) -> String {
    raw.trim()
        .strip_prefix("sha1=")
        .unwrap_or(raw.trim())
        .chars()
        .filter(|character| !character.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn constant_time_equals(left: &str, right: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.as_bytes().ct_eq(right.as_bytes()).into()
}
