use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Stored at `glvault:key:<alias>` as JSON. The `ciphertext`/`iv`/`auth_tag`
/// triple is AES-256-GCM output over the raw credential, hex-encoded; all
/// other fields are plaintext metadata so quota accounting never decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub alias: String,
    /// Hex AES-256-GCM ciphertext (tag split off).
    pub ciphertext: String,
    /// Hex 12-byte random IV.
    pub iv: String,
    /// Hex 16-byte GCM authentication tag.
    pub auth_tag: String,
    /// Absolute URL of the upstream API: scheme + host + optional path prefix.
    pub base_url: String,
    /// Maximum relays per rolling window.
    pub quota_limit: u64,
    /// Relays consumed in the current window.
    pub quota_used: u64,
    /// Unix-ms opening of the current window.
    pub quota_window_start: i64,
    /// Unix-ms of registration.
    pub created_at: i64,
    /// Unix-ms of the most recent rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<i64>,
    /// Provenance identifier; not used for authorization.
    pub owner: String,
}

impl CredentialRecord {
    /// Projection for list/register responses; never includes the
    /// ciphertext fields.
    pub fn meta(&self) -> CredentialMeta {
        CredentialMeta {
            alias: self.alias.clone(),
            base_url: self.base_url.clone(),
            quota_limit: self.quota_limit,
            quota_used: self.quota_used,
            quota_window_start: self.quota_window_start,
            created_at: self.created_at,
            rotated_at: self.rotated_at,
            owner: self.owner.clone(),
        }
    }
}

/// Metadata view of a credential returned by admin endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMeta {
    pub alias: String,
    pub base_url: String,
    pub quota_limit: u64,
    pub quota_used: u64,
    pub quota_window_start: i64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<i64>,
    pub owner: String,
}

/// One attempted relay, stored at `glvault:audit:<alias>:<id>`.
/// Entries are append-only; never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 16 hex chars (64 bits) from the OS RNG, assigned on append.
    pub id: String,
    pub alias: String,
    pub caller: String,
    pub path: String,
    pub method: String,
    /// Outcome code: upstream status, or 404/429/500/502 for terminal
    /// failures after verification.
    pub status: u16,
    pub latency_ms: u64,
    /// Unix-ms of entry creation.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `{id, ts}` pair in the per-alias audit index at
/// `glvault:audit_index:<alias>`, ascending by insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditIndexEntry {
    pub id: String,
    pub ts: i64,
}

/// Outcome of a quota check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u64,
}

const MAX_ALIAS_LEN: usize = 64;

/// Aliases are `[A-Za-z0-9_-]{1,64}`, safe inside the `:`-delimited signed
/// payload and the backend key namespace.
pub fn validate_alias(alias: &str) -> Result<(), VaultError> {
    let ok = !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(VaultError::InvalidInput(
            "alias must be 1-64 characters of [A-Za-z0-9_-]".into(),
        ))
    }
}
