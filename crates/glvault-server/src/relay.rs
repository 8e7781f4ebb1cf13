use std::collections::HashMap;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Method;
use url::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::verify_relay_request;
use crate::error::VaultError;
use crate::store::{now_ms, AuditEntry};
use crate::AppState;

/// Body of `POST /proxy`. Unknown fields are ignored; `body` and `headers`
/// are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    pub alias: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Unix-ms at signing time.
    pub timestamp: i64,
    pub nonce: String,
}

/// Host-suffix → credential query-parameter name. Checked after any
/// operator-configured overrides; `api_key` when nothing matches.
const DEFAULT_KEY_PARAMS: &[(&str, &str)] = &[
    ("openweathermap.org", "appid"),
    ("newsapi.org", "apiKey"),
    ("alphavantage.co", "apikey"),
    ("googleapis.com", "key"),
];

const DEFAULT_KEY_PARAM: &str = "api_key";

fn host_matches(host: &str, suffix: &str) -> bool {
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Pick the query-parameter name the upstream expects the credential under,
/// by suffix-matching the base URL's host.
pub fn key_param_for(base_url: &str, overrides: &[(String, String)]) -> String {
    let Some(host) = Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
    else {
        return DEFAULT_KEY_PARAM.to_owned();
    };

    for (suffix, param) in overrides {
        if host_matches(&host, suffix) {
            return param.clone();
        }
    }
    for (suffix, param) in DEFAULT_KEY_PARAMS {
        if host_matches(&host, suffix) {
            return (*param).to_owned();
        }
    }
    DEFAULT_KEY_PARAM.to_owned()
}

/// Join `base_url` and `path`, then append the credential as a query
/// parameter. The credential goes through the URL query serializer, never
/// string splicing.
pub fn build_upstream_url(
    base_url: &str,
    path: &str,
    param: &str,
    credential: &str,
) -> Result<Url, VaultError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&joined)
        .map_err(|e| VaultError::InvalidInput(format!("invalid upstream URL: {e}")))?;
    url.query_pairs_mut().append_pair(param, credential);
    Ok(url)
}

/// `POST /proxy`: the relay pipeline. Each step's failure is terminal and
/// fixes the response code; every terminal state at or after the quota check
/// is recorded in the audit log. Verification failures are not audited:
/// they are attributable only to the signer and would fill the log.
pub async fn handle_proxy(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let Ok(Json(req)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Malformed request body"})),
        )
            .into_response();
    };

    // ── VERIFY ───────────────────────────────────────────────────────────
    let signature = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Signature "));
    let Some(signature) = signature else {
        return unauthorized("Missing or malformed Authorization header");
    };

    let now = now_ms();
    if let Err(reason) = verify_relay_request(
        &req,
        signature,
        &state.hmac_secret,
        state.max_request_age_ms,
        now,
    ) {
        debug!(alias = %req.alias, reason, "relay verification failed");
        return unauthorized(reason);
    }

    if !state.nonces.insert(&req.nonce, now) {
        return unauthorized("Nonce already used");
    }

    let caller = headers
        .get("X-Caller-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_owned();

    // ── RATE ─────────────────────────────────────────────────────────────
    let decision = match state.store.increment_usage(&req.alias).await {
        Ok(decision) => decision,
        Err(VaultError::NotFound(_)) => {
            record_attempt(&state, &req, &caller, 404, &started, Some("Unknown alias".into()))
                .await;
            return VaultError::NotFound("Unknown alias".into()).into_response();
        }
        Err(e) => {
            record_attempt(&state, &req, &caller, 500, &started, Some("Storage failure".into()))
                .await;
            return e.into_response();
        }
    };

    if !decision.allowed {
        record_attempt(&state, &req, &caller, 429, &started, Some("Rate limit exceeded".into()))
            .await;
        return VaultError::RateLimited {
            retry_after_ms: state.rate_limit_window_ms,
        }
        .into_response();
    }

    // ── DECRYPT ──────────────────────────────────────────────────────────
    // The record may vanish between the quota write and here (deletion
    // race); that surfaces as 404, same as an unknown alias.
    let record = match state.store.get_record(&req.alias).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            record_attempt(&state, &req, &caller, 404, &started, Some("Unknown alias".into()))
                .await;
            return VaultError::NotFound("Unknown alias".into()).into_response();
        }
        Err(e) => {
            record_attempt(&state, &req, &caller, 500, &started, Some("Storage failure".into()))
                .await;
            return e.into_response();
        }
    };

    let credential = match state.store.get_plaintext(&req.alias).await {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            record_attempt(&state, &req, &caller, 404, &started, Some("Unknown alias".into()))
                .await;
            return VaultError::NotFound("Unknown alias".into()).into_response();
        }
        Err(e) => {
            let reason = match &e {
                VaultError::Integrity => "Credential integrity check failed",
                _ => "Storage failure",
            };
            record_attempt(&state, &req, &caller, 500, &started, Some(reason.into())).await;
            return e.into_response();
        }
    };

    // ── DISPATCH ─────────────────────────────────────────────────────────
    let param = key_param_for(&record.base_url, &state.key_params);
    let url = match build_upstream_url(&record.base_url, &req.path, &param, &credential) {
        Ok(url) => url,
        Err(e) => {
            record_attempt(&state, &req, &caller, 400, &started, Some("Invalid upstream URL".into()))
                .await;
            return e.into_response();
        }
    };

    let method = match req.method.as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        // verify_relay_request restricted the set.
        _ => Method::DELETE,
    };

    let mut upstream = state
        .http
        .request(method, url)
        .header(
            header::USER_AGENT,
            concat!("glvault-relay/", env!("CARGO_PKG_VERSION")),
        )
        .header(header::ACCEPT, "application/json");

    if let Some(extra) = &req.headers {
        for (name, value) in extra {
            match name.parse::<reqwest::header::HeaderName>() {
                Ok(name) => upstream = upstream.header(name, value),
                Err(_) => debug!(header = %name, "dropping invalid caller header"),
            }
        }
    }

    if req.method != "GET" {
        if let Some(body) = &req.body {
            upstream = upstream.json(body);
        }
    }

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            // without_url: reqwest errors render the full URL, which here
            // carries the injected credential.
            let e = e.without_url();
            let latency_ms = started.elapsed().as_millis() as u64;
            record_attempt(
                &state,
                &req,
                &caller,
                502,
                &started,
                Some(format!("Upstream request failed: {e}")),
            )
            .await;
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Upstream request failed", "latency_ms": latency_ms})),
            )
                .into_response();
        }
    };

    let upstream_status = response.status().as_u16();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    let data = match response.text().await {
        Ok(text) if is_json => {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        }
        Ok(text) => Value::String(text),
        Err(e) => {
            let e = e.without_url();
            let latency_ms = started.elapsed().as_millis() as u64;
            record_attempt(
                &state,
                &req,
                &caller,
                502,
                &started,
                Some(format!("Upstream body read failed: {e}")),
            )
            .await;
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Upstream request failed", "latency_ms": latency_ms})),
            )
                .into_response();
        }
    };

    // ── SANITIZE + AUDIT ─────────────────────────────────────────────────
    // The caller sees only this projection: upstream headers are dropped and
    // the credential exists nowhere in the response.
    let latency_ms = started.elapsed().as_millis() as u64;
    record_attempt(&state, &req, &caller, upstream_status, &started, None).await;

    Json(json!({
        "status": upstream_status,
        "data": data,
        "cached": false,
        "latency_ms": latency_ms,
        "remaining_quota": decision.remaining,
    }))
    .into_response()
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": reason}))).into_response()
}

/// Best-effort audit append: a failed write is logged and never fails the
/// relay response.
async fn record_attempt(
    state: &AppState,
    req: &ProxyRequest,
    caller: &str,
    status: u16,
    started: &Instant,
    error: Option<String>,
) {
    let entry = AuditEntry {
        id: String::new(), // assigned on append
        alias: req.alias.clone(),
        caller: caller.to_owned(),
        path: req.path.clone(),
        method: req.method.clone(),
        status,
        latency_ms: started.elapsed().as_millis() as u64,
        timestamp: now_ms(),
        error,
    };
    if let Err(e) = state.audit.append(entry).await {
        warn!(alias = %req.alias, error = %e, "audit append failed");
    }
}
