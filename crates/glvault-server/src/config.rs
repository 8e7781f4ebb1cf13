use anyhow::{Context, Result};

use crate::store::MasterKey;

/// Process configuration, read from the environment exactly once at startup.
/// Anything required that is absent or mis-sized fails loudly before the
/// server binds.
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 32-byte AES-256-GCM key from `MASTER_ENCRYPTION_KEY` (64 hex chars).
    pub master_key: MasterKey,
    /// Secret the caller SDK signs relay requests with.
    pub hmac_secret: String,
    /// Bearer token for the administration endpoints.
    pub admin_token: String,
    pub rate_limit_window_ms: i64,
    pub max_request_age_ms: i64,
    pub upstream_timeout_ms: u64,
    pub log_level: String,
    /// Networked backend selection; both set → REST KV, else in-memory.
    pub kv_rest_url: Option<String>,
    pub kv_rest_token: Option<String>,
    /// Operator extensions to the host-suffix → key-parameter table.
    pub key_params: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let master_key_hex = std::env::var("MASTER_ENCRYPTION_KEY")
            .context("MASTER_ENCRYPTION_KEY environment variable is required")?;
        let master_key = MasterKey::from_hex(&master_key_hex)
            .map_err(|e| anyhow::anyhow!("MASTER_ENCRYPTION_KEY: {e}"))?;

        let hmac_secret =
            std::env::var("HMAC_SECRET").context("HMAC_SECRET environment variable is required")?;
        if hmac_secret.is_empty() {
            anyhow::bail!("HMAC_SECRET must not be empty");
        }

        let admin_token =
            std::env::var("ADMIN_TOKEN").context("ADMIN_TOKEN environment variable is required")?;
        if admin_token.is_empty() {
            anyhow::bail!("ADMIN_TOKEN must not be empty");
        }

        Ok(Self {
            host: std::env::var("GLVAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("GLVAULT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            master_key,
            hmac_secret,
            admin_token,
            rate_limit_window_ms: env_i64("RATE_LIMIT_WINDOW_MS", 60_000)?,
            max_request_age_ms: env_i64("MAX_REQUEST_AGE_MS", 30_000)?,
            upstream_timeout_ms: env_i64("UPSTREAM_TIMEOUT_MS", 10_000)? as u64,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            kv_rest_url: std::env::var("KV_REST_URL").ok(),
            kv_rest_token: std::env::var("KV_REST_TOKEN").ok(),
            key_params: parse_key_params(
                &std::env::var("UPSTREAM_KEY_PARAMS").unwrap_or_default(),
            ),
        })
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer, got '{raw}'")),
    }
}

/// `"suffix=param,suffix=param"` → ordered override pairs. Malformed
/// segments are skipped.
fn parse_key_params(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (suffix, param) = pair.split_once('=')?;
            let (suffix, param) = (suffix.trim(), param.trim());
            if suffix.is_empty() || param.is_empty() {
                return None;
            }
            Some((suffix.to_owned(), param.to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_params_parse_pairs_and_skip_garbage() {
        let parsed = parse_key_params("example.com=token, mapbox.com=access_token,bad,=x,y=");
        assert_eq!(
            parsed,
            vec![
                ("example.com".to_owned(), "token".to_owned()),
                ("mapbox.com".to_owned(), "access_token".to_owned()),
            ]
        );
        assert!(parse_key_params("").is_empty());
    }

    #[test]
    fn env_i64_rejects_non_integers() {
        // Var name chosen to not collide with anything real.
        std::env::set_var("GLVAULT_TEST_WINDOW", "abc");
        assert!(env_i64("GLVAULT_TEST_WINDOW", 5).is_err());
        std::env::set_var("GLVAULT_TEST_WINDOW", "250");
        assert_eq!(env_i64("GLVAULT_TEST_WINDOW", 5).unwrap(), 250);
        std::env::remove_var("GLVAULT_TEST_WINDOW");
        assert_eq!(env_i64("GLVAULT_TEST_WINDOW", 5).unwrap(), 5);
    }
}
