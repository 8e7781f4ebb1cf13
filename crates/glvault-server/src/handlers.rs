use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::store::AuditQuery;
use crate::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

/// Probes the backend through the credential index; a failed probe degrades
/// the service to 503.
pub async fn health(State(state): State<AppState>) -> Response {
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    match state.store.count().await {
        Ok(keys_registered) => Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_ms": uptime_ms,
            "storage": "connected",
            "keys_registered": keys_registered,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_ms": uptime_ms,
                    "storage": "disconnected",
                    "keys_registered": 0,
                })),
            )
                .into_response()
        }
    }
}

// ── Register ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub alias: String,
    pub api_key: String,
    pub base_url: String,
    pub quota_limit: Option<u64>,
    pub owner: Option<String>,
}

pub async fn register_key(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    match state
        .store
        .register(
            &body.alias,
            &body.api_key,
            &body.base_url,
            body.quota_limit,
            body.owner,
        )
        .await
    {
        Ok(record) => {
            info!(alias = %record.alias, "audit: key.register");
            (StatusCode::CREATED, Json(record.meta())).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── List ──────────────────────────────────────────────────────────────────────

pub async fn list_keys(State(state): State<AppState>) -> Response {
    match state.store.list().await {
        Ok(keys) => {
            info!(count = keys.len(), "audit: key.list");
            Json(json!({"count": keys.len(), "keys": keys})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Rotate ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    pub alias: String,
    pub new_api_key: String,
}

pub async fn rotate_key(
    State(state): State<AppState>,
    Json(body): Json<RotateRequest>,
) -> Response {
    match state.store.rotate(&body.alias, &body.new_api_key).await {
        Ok(record) => {
            info!(alias = %record.alias, "audit: key.rotate");
            Json(json!({"alias": record.alias, "rotated_at": record.rotated_at})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Remove ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub alias: String,
}

pub async fn remove_key(
    State(state): State<AppState>,
    Json(body): Json<RemoveRequest>,
) -> Response {
    match state.store.remove(&body.alias).await {
        Ok(deleted) => {
            info!(alias = %body.alias, deleted, "audit: key.remove");
            Json(json!({"alias": body.alias, "deleted": deleted})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Audit ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub alias: String,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn audit_for_alias(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Response {
    let stats = match state.audit.stats(&params.alias, params.since).await {
        Ok(stats) => stats,
        Err(e) => return e.into_response(),
    };

    let query = AuditQuery {
        since: params.since,
        until: None,
        limit: params.limit,
    };
    match state.audit.query(&params.alias, &query).await {
        Ok(entries) => Json(json!({
            "alias": params.alias,
            "stats": stats,
            "entries": entries,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}
