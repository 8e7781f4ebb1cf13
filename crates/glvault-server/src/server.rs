use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{require_admin, NonceCache};
use crate::config::Config;
use crate::handlers::{audit_for_alias, health, list_keys, register_key, remove_key, rotate_key};
use crate::relay::handle_proxy;
use crate::store::{AuditLog, KeyStore, MemoryBackend, RestKvBackend, StorageBackend};
use crate::AppState;

/// Assemble the full route table over `state`. Public so tests can mount it
/// on an ephemeral listener.
pub fn router(state: AppState) -> Router {
    let relay = Router::new().route("/proxy", post(handle_proxy));

    // Administration surface: everything behind the admin bearer check,
    // including the health probe.
    let admin = Router::new()
        .route("/keys/register", post(register_key))
        .route("/keys/list", get(list_keys))
        .route("/keys/rotate", post(rotate_key))
        .route("/keys/remove", delete(remove_key))
        .route("/keys/audit", get(audit_for_alias))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new().merge(relay).merge(admin).with_state(state)
}

pub async fn run(cfg: Config) -> Result<()> {
    let backend: Arc<dyn StorageBackend> = match (&cfg.kv_rest_url, &cfg.kv_rest_token) {
        (Some(url), Some(token)) => {
            info!(url = %url, "using REST KV storage backend");
            Arc::new(RestKvBackend::new(url, token)?)
        }
        _ => {
            warn!("KV_REST_URL/KV_REST_TOKEN not set; using in-memory storage, data is lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.upstream_timeout_ms))
        .build()
        .context("build upstream http client")?;

    let state = AppState {
        store: KeyStore::new(
            backend.clone(),
            Arc::new(cfg.master_key),
            cfg.rate_limit_window_ms,
        ),
        audit: AuditLog::new(backend),
        http,
        nonces: Arc::new(NonceCache::new(cfg.max_request_age_ms)),
        hmac_secret: Arc::new(cfg.hmac_secret),
        admin_token: Arc::new(cfg.admin_token),
        rate_limit_window_ms: cfg.rate_limit_window_ms,
        max_request_age_ms: cfg.max_request_age_ms,
        key_params: Arc::new(cfg.key_params),
        started: Instant::now(),
    };

    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "glvault relay listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}
