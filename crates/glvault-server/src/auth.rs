use std::collections::HashMap;
use std::sync::Mutex;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::relay::ProxyRequest;
use crate::store::crypto::compute_signature;
use crate::AppState;

/// Methods a relay request may name. Everything else is rejected before the
/// signature is even computed.
pub const ALLOWED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// The signed byte string: `alias:method:path:timestamp:nonce`. Aliases and
/// methods cannot contain the `:` delimiter; path, timestamp, and nonce are
/// safe by construction.
pub fn canonical_payload(
    alias: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
) -> String {
    format!("{alias}:{method}:{path}:{timestamp}:{nonce}")
}

/// HMAC-SHA-256 tag over the canonical payload, as 64 lowercase hex chars:
/// the exact value a caller puts in `Authorization: Signature <hex>`.
pub fn sign_relay_request(
    alias: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    secret: &str,
) -> String {
    let payload = canonical_payload(alias, method, path, timestamp, nonce);
    hex::encode(compute_signature(secret.as_bytes(), payload.as_bytes()))
}

/// Verify a relay request against `provided_sig` (hex). Returns the
/// rejection reason on failure. Checks run in a fixed order: freshness,
/// required fields, method, then the constant-time signature comparison.
/// Length mismatch and value mismatch are indistinguishable externally.
pub fn verify_relay_request(
    req: &ProxyRequest,
    provided_sig: &str,
    secret: &str,
    max_age_ms: i64,
    now: i64,
) -> Result<(), &'static str> {
    if (now - req.timestamp).abs() > max_age_ms {
        return Err("Request expired");
    }

    if req.alias.is_empty() || req.path.is_empty() || req.method.is_empty() || req.nonce.is_empty()
    {
        return Err("Missing required field");
    }

    if !ALLOWED_METHODS.contains(&req.method.as_str()) {
        return Err("Unsupported method");
    }

    let expected = compute_signature(
        secret.as_bytes(),
        canonical_payload(&req.alias, &req.method, &req.path, req.timestamp, &req.nonce).as_bytes(),
    );
    let provided = hex::decode(provided_sig).map_err(|_| "Invalid signature")?;
    if !constant_time_eq(&provided, &expected) {
        return Err("Invalid signature");
    }

    Ok(())
}

/// In-process replay guard: a nonce may be used once per freshness window.
/// Seen nonces are pruned opportunistically as they age past `max_age_ms`.
pub struct NonceCache {
    max_age_ms: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceCache {
    pub fn new(max_age_ms: i64) -> Self {
        Self {
            max_age_ms,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` at `now`. Returns false if it was already seen within
    /// the window.
    pub fn insert(&self, nonce: &str, now: i64) -> bool {
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, first_seen| now - *first_seen <= self.max_age_ms);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_owned(), now);
        true
    }
}

/// Check an `Authorization` header against the admin token. The header must
/// be exactly `Bearer <token>`; both length and value mismatches fail the
/// constant-time comparison.
pub fn verify_admin(header: Option<&str>, expected: &str) -> Result<(), &'static str> {
    let Some(header) = header else {
        return Err("Missing Authorization header");
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err("Invalid Authorization format");
    };
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return Err("Invalid admin token");
    }
    Ok(())
}

/// Axum middleware guarding the administration routes.
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match verify_admin(header, &state.admin_token) {
        Ok(()) => next.run(request).await,
        Err(reason) => {
            (StatusCode::UNAUTHORIZED, Json(json!({"error": reason}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s";
    const NOW: i64 = 1_700_000_000_000;

    fn request(alias: &str, method: &str, path: &str, timestamp: i64, nonce: &str) -> ProxyRequest {
        ProxyRequest {
            alias: alias.into(),
            path: path.into(),
            method: method.into(),
            body: None,
            headers: None,
            timestamp,
            nonce: nonce.into(),
        }
    }

    fn signed(alias: &str, method: &str, path: &str, timestamp: i64, nonce: &str) -> (ProxyRequest, String) {
        let sig = sign_relay_request(alias, method, path, timestamp, nonce, SECRET);
        (request(alias, method, path, timestamp, nonce), sig)
    }

    #[test]
    fn valid_signature_passes() {
        let (req, sig) = signed("weather", "GET", "/data/2.5/weather?q=Tokyo", NOW, "n1");
        assert_eq!(
            verify_relay_request(&req, &sig, SECRET, 30_000, NOW),
            Ok(())
        );
    }

    #[test]
    fn signature_is_64_lowercase_hex() {
        let sig = sign_relay_request("a", "GET", "/p", NOW, "n", SECRET);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn stale_timestamp_rejected_symmetrically() {
        // One ms inside the window on each side passes.
        for skew in [-29_999i64, 29_999] {
            let (req, sig) = signed("a", "GET", "/p", NOW + skew, "n");
            assert!(verify_relay_request(&req, &sig, SECRET, 30_000, NOW).is_ok());
        }
        // One ms past it on each side fails with the freshness reason.
        for skew in [-30_001i64, 30_001] {
            let (req, sig) = signed("a", "GET", "/p", NOW + skew, "n");
            assert_eq!(
                verify_relay_request(&req, &sig, SECRET, 30_000, NOW),
                Err("Request expired")
            );
        }
    }

    #[test]
    fn empty_fields_rejected() {
        for (alias, method, path, nonce) in [
            ("", "GET", "/p", "n"),
            ("a", "", "/p", "n"),
            ("a", "GET", "", "n"),
            ("a", "GET", "/p", ""),
        ] {
            let (req, sig) = signed(alias, method, path, NOW, nonce);
            assert_eq!(
                verify_relay_request(&req, &sig, SECRET, 30_000, NOW),
                Err("Missing required field")
            );
        }
    }

    #[test]
    fn unknown_method_rejected() {
        let (req, sig) = signed("a", "PATCH", "/p", NOW, "n");
        assert_eq!(
            verify_relay_request(&req, &sig, SECRET, 30_000, NOW),
            Err("Unsupported method")
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let (req, _) = signed("a", "GET", "/p", NOW, "n");
        let sig = sign_relay_request("a", "GET", "/p", NOW, "n", "other-secret");
        assert_eq!(
            verify_relay_request(&req, &sig, SECRET, 30_000, NOW),
            Err("Invalid signature")
        );
    }

    #[test]
    fn truncated_and_non_hex_signatures_rejected_identically() {
        let (req, sig) = signed("a", "GET", "/p", NOW, "n");
        assert_eq!(
            verify_relay_request(&req, &sig[..32], SECRET, 30_000, NOW),
            Err("Invalid signature")
        );
        assert_eq!(
            verify_relay_request(&req, "zz not hex", SECRET, 30_000, NOW),
            Err("Invalid signature")
        );
    }

    #[test]
    fn tampered_field_invalidates_signature() {
        let (_, sig) = signed("a", "GET", "/p", NOW, "n");
        let tampered = request("a", "GET", "/other", NOW, "n");
        assert_eq!(
            verify_relay_request(&tampered, &sig, SECRET, 30_000, NOW),
            Err("Invalid signature")
        );
    }

    #[test]
    fn nonce_cache_rejects_reuse_within_window() {
        let cache = NonceCache::new(30_000);
        assert!(cache.insert("n1", NOW));
        assert!(!cache.insert("n1", NOW + 1000));
        assert!(cache.insert("n2", NOW));
    }

    #[test]
    fn nonce_cache_forgets_after_window() {
        let cache = NonceCache::new(30_000);
        assert!(cache.insert("n1", NOW));
        assert!(cache.insert("n1", NOW + 30_001));
    }

    #[test]
    fn admin_header_variants() {
        assert_eq!(
            verify_admin(None, "tok"),
            Err("Missing Authorization header")
        );
        assert_eq!(
            verify_admin(Some("Basic xyz"), "tok"),
            Err("Invalid Authorization format")
        );
        assert_eq!(
            verify_admin(Some("Bearer wrong"), "tok"),
            Err("Invalid admin token")
        );
        assert_eq!(verify_admin(Some("Bearer tok"), "tok"), Ok(()));
        // No double space, no lowercase scheme.
        assert!(verify_admin(Some("bearer tok"), "tok").is_err());
        assert!(verify_admin(Some("Bearer  tok"), "tok").is_err());
    }
}
