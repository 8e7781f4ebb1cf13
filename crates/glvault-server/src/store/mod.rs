use std::time::{SystemTime, UNIX_EPOCH};

pub mod audit;
pub mod backend;
pub mod crypto;
pub mod keys;
pub mod kv_rest;
pub mod model;

pub use audit::{AuditLog, AuditQuery, AuditStats, AUDIT_INDEX_MAX};
pub use backend::{MemoryBackend, StorageBackend};
pub use crypto::MasterKey;
pub use keys::KeyStore;
pub use kv_rest::RestKvBackend;
pub use model::{AuditEntry, CredentialMeta, CredentialRecord, QuotaDecision};

/// Current unix time in milliseconds, the timestamp unit of every persisted
/// record and every signed payload.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
