pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

/// Shared application state threaded through axum handlers. Built once at
/// startup; secrets live here and are never serialized to the backend.
#[derive(Clone)]
pub struct AppState {
    pub store: store::KeyStore,
    pub audit: store::AuditLog,
    /// Upstream dispatch client, timeout applied at construction.
    pub http: reqwest::Client,
    pub nonces: Arc<auth::NonceCache>,
    pub hmac_secret: Arc<String>,
    pub admin_token: Arc<String>,
    pub rate_limit_window_ms: i64,
    pub max_request_age_ms: i64,
    /// Operator overrides for the host-suffix → key-parameter table.
    pub key_params: Arc<Vec<(String, String)>>,
    pub started: Instant,
}

pub use config::Config;
pub use error::VaultError;
pub use server::{router, run};
