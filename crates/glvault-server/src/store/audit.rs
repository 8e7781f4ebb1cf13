use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::backend::StorageBackend;
use super::crypto::random_hex;
use super::model::{AuditEntry, AuditIndexEntry};
use super::now_ms;
use crate::error::VaultError;

/// Entries reachable through a per-alias index; older ones are evicted.
pub const AUDIT_INDEX_MAX: usize = 10_000;

fn entry_key(alias: &str, id: &str) -> String {
    format!("glvault:audit:{alias}:{id}")
}

fn index_key(alias: &str) -> String {
    format!("glvault:audit_index:{alias}")
}

/// Query window for [`AuditLog::query`]. Unset fields fall back to
/// `[0, now]` and a limit of 100.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

const DEFAULT_QUERY_LIMIT: usize = 100;

/// Aggregates over a window of audit entries. An entry is an error when its
/// status is ≥ 400.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditStats {
    pub total_requests: u64,
    pub error_count: u64,
    pub avg_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<i64>,
}

/// Append-only log of relay attempts, one entry per attempt, with a bounded
/// per-alias index. Entries are never updated after creation.
#[derive(Clone)]
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
    index_max: usize,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_index_max(backend, AUDIT_INDEX_MAX)
    }

    /// Bound override for tests exercising eviction.
    pub fn with_index_max(backend: Arc<dyn StorageBackend>, index_max: usize) -> Self {
        Self { backend, index_max }
    }

    /// Assign a fresh id, persist the entry, and append `{id, ts}` to the
    /// alias index, trimming it to the configured bound. Entries trimmed off
    /// the index are deleted from the backend.
    pub async fn append(&self, mut entry: AuditEntry) -> Result<(), VaultError> {
        entry.id = random_hex(8);

        let json = serde_json::to_string(&entry)
            .map_err(|e| VaultError::Backend(format!("serialize audit entry: {e}")))?;
        self.backend
            .set(&entry_key(&entry.alias, &entry.id), &json)
            .await?;

        let mut index = self.load_index(&entry.alias).await?;
        index.push(AuditIndexEntry {
            id: entry.id.clone(),
            ts: entry.timestamp,
        });

        if index.len() > self.index_max {
            let evicted: Vec<AuditIndexEntry> =
                index.drain(..index.len() - self.index_max).collect();
            for old in &evicted {
                // Eviction is housekeeping; a failed delete only leaks an
                // unreachable entry.
                if let Err(e) = self.backend.delete(&entry_key(&entry.alias, &old.id)).await {
                    warn!(alias = %entry.alias, id = %old.id, error = %e, "audit eviction failed");
                }
            }
        }

        self.save_index(&entry.alias, &index).await
    }

    /// Entries for `alias` within `[since, until]`, most recent first.
    pub async fn query(
        &self,
        alias: &str,
        query: &AuditQuery,
    ) -> Result<Vec<AuditEntry>, VaultError> {
        let since = query.since.unwrap_or(0);
        let until = query.until.unwrap_or_else(now_ms);
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

        let index = self.load_index(alias).await?;

        let mut entries = Vec::new();
        // Index is ascending by insertion; walk backwards for newest-first.
        for slot in index.iter().rev() {
            if slot.ts < since || slot.ts > until {
                continue;
            }
            if entries.len() >= limit {
                break;
            }
            match self.backend.get(&entry_key(alias, &slot.id)).await? {
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(alias = %alias, id = %slot.id, error = %e, "corrupt audit entry"),
                },
                // Indexed but deleted out from under us; skip.
                None => continue,
            }
        }
        Ok(entries)
    }

    /// Aggregates over `[since, now]`; `since` defaults to the last 24 hours.
    pub async fn stats(&self, alias: &str, since: Option<i64>) -> Result<AuditStats, VaultError> {
        let now = now_ms();
        let since = since.unwrap_or(now - 24 * 60 * 60 * 1000);

        let entries = self
            .query(
                alias,
                &AuditQuery {
                    since: Some(since),
                    until: Some(now),
                    limit: Some(usize::MAX),
                },
            )
            .await?;

        if entries.is_empty() {
            return Ok(AuditStats {
                total_requests: 0,
                error_count: 0,
                avg_latency_ms: 0,
                last_accessed: None,
            });
        }

        let total = entries.len() as u64;
        let errors = entries.iter().filter(|e| e.status >= 400).count() as u64;
        let latency_sum: u64 = entries.iter().map(|e| e.latency_ms).sum();
        let avg = (latency_sum as f64 / total as f64).round() as u64;
        let last = entries.iter().map(|e| e.timestamp).max();

        Ok(AuditStats {
            total_requests: total,
            error_count: errors,
            avg_latency_ms: avg,
            last_accessed: last,
        })
    }

    async fn load_index(&self, alias: &str) -> Result<Vec<AuditIndexEntry>, VaultError> {
        match self.backend.get(&index_key(alias)).await? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| VaultError::Backend(format!("corrupt audit index: {e}"))),
        }
    }

    async fn save_index(&self, alias: &str, index: &[AuditIndexEntry]) -> Result<(), VaultError> {
        let json = serde_json::to_string(index)
            .map_err(|e| VaultError::Backend(format!("serialize audit index: {e}")))?;
        self.backend.set(&index_key(alias), &json).await
    }
}
