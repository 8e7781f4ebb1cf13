use std::sync::Arc;

use tracing::{debug, info};

use super::backend::StorageBackend;
use super::crypto::{self, MasterKey};
use super::model::{validate_alias, CredentialMeta, CredentialRecord, QuotaDecision};
use super::now_ms;
use crate::error::VaultError;

const RECORD_PREFIX: &str = "glvault:key:";
const INDEX_KEY: &str = "glvault:index";

/// Default relays per window when `register` omits a limit.
const DEFAULT_QUOTA_LIMIT: u64 = 1000;
const DEFAULT_OWNER: &str = "admin";

fn record_key(alias: &str) -> String {
    format!("{RECORD_PREFIX}{alias}")
}

/// Typed credential operations over the storage backend. Every record is
/// encrypted under the master key before it reaches the backend; plaintext
/// exists only in the return value of [`KeyStore::get_plaintext`].
///
/// Reads and writes of a single record are NOT linearizable (the backend
/// contract has no compare-and-set), so concurrent relays may over- or
/// under-count quota by at most the number of racing requests.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
    master_key: Arc<MasterKey>,
    window_ms: i64,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>, master_key: Arc<MasterKey>, window_ms: i64) -> Self {
        Self {
            backend,
            master_key,
            window_ms,
        }
    }

    /// Register a new credential under `alias`.
    pub async fn register(
        &self,
        alias: &str,
        plaintext: &str,
        base_url: &str,
        quota_limit: Option<u64>,
        owner: Option<String>,
    ) -> Result<CredentialRecord, VaultError> {
        validate_alias(alias)?;
        validate_base_url(base_url)?;

        if self.backend.get(&record_key(alias)).await?.is_some() {
            return Err(VaultError::AlreadyExists(format!(
                "alias '{alias}' is already registered"
            )));
        }

        let (ciphertext, iv, auth_tag) = crypto::encrypt(&self.master_key, plaintext.as_bytes())?;
        let now = now_ms();

        let record = CredentialRecord {
            alias: alias.to_owned(),
            ciphertext: hex::encode(ciphertext),
            iv: hex::encode(iv),
            auth_tag: hex::encode(auth_tag),
            base_url: base_url.to_owned(),
            quota_limit: quota_limit.unwrap_or(DEFAULT_QUOTA_LIMIT),
            quota_used: 0,
            quota_window_start: now,
            created_at: now,
            rotated_at: None,
            owner: owner.unwrap_or_else(|| DEFAULT_OWNER.to_owned()),
        };

        self.put_record(&record).await?;

        let mut index = self.load_index().await?;
        if !index.iter().any(|a| a == alias) {
            index.push(alias.to_owned());
            self.save_index(&index).await?;
        }

        info!(alias = %alias, base_url = %base_url, "registered credential");
        Ok(record)
    }

    /// Fetch a record without decrypting. The relay handler reads `base_url`
    /// through this.
    pub async fn get_record(&self, alias: &str) -> Result<Option<CredentialRecord>, VaultError> {
        match self.backend.get(&record_key(alias)).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(parse_record(&raw)?)),
        }
    }

    /// Decrypt the credential for `alias`. `Ok(None)` if the alias is
    /// unknown; tag mismatch propagates as [`VaultError::Integrity`].
    pub async fn get_plaintext(&self, alias: &str) -> Result<Option<String>, VaultError> {
        let Some(record) = self.get_record(alias).await? else {
            return Ok(None);
        };

        let ciphertext = hex::decode(&record.ciphertext).map_err(|_| VaultError::Integrity)?;
        let iv: [u8; crypto::IV_LEN] = hex::decode(&record.iv)
            .map_err(|_| VaultError::Integrity)?
            .try_into()
            .map_err(|_| VaultError::Integrity)?;
        let auth_tag: [u8; crypto::TAG_LEN] = hex::decode(&record.auth_tag)
            .map_err(|_| VaultError::Integrity)?
            .try_into()
            .map_err(|_| VaultError::Integrity)?;

        let plaintext = crypto::decrypt(&self.master_key, &ciphertext, &iv, &auth_tag)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| VaultError::Integrity)
    }

    /// Re-encrypt `alias` with a fresh IV. Quota fields, `created_at`, and
    /// `owner` are preserved; only the ciphertext triple and `rotated_at`
    /// change, in a single backend write.
    pub async fn rotate(
        &self,
        alias: &str,
        new_plaintext: &str,
    ) -> Result<CredentialRecord, VaultError> {
        let Some(mut record) = self.get_record(alias).await? else {
            return Err(VaultError::NotFound(format!("alias '{alias}' not found")));
        };

        let (ciphertext, iv, auth_tag) =
            crypto::encrypt(&self.master_key, new_plaintext.as_bytes())?;
        record.ciphertext = hex::encode(ciphertext);
        record.iv = hex::encode(iv);
        record.auth_tag = hex::encode(auth_tag);
        record.rotated_at = Some(now_ms());

        self.put_record(&record).await?;
        info!(alias = %alias, "rotated credential");
        Ok(record)
    }

    /// Delete `alias` and drop it from the index. Returns whether it existed.
    pub async fn remove(&self, alias: &str) -> Result<bool, VaultError> {
        let existed = self.backend.get(&record_key(alias)).await?.is_some();
        if existed {
            self.backend.delete(&record_key(alias)).await?;
            let mut index = self.load_index().await?;
            index.retain(|a| a != alias);
            self.save_index(&index).await?;
            info!(alias = %alias, "removed credential");
        }
        Ok(existed)
    }

    /// Metadata for every registered credential. Never returns decrypted
    /// material or ciphertext fields; order is unspecified.
    pub async fn list(&self) -> Result<Vec<CredentialMeta>, VaultError> {
        let index = self.load_index().await?;
        let mut metas = Vec::with_capacity(index.len());
        for alias in &index {
            // A record deleted between index read and record read is skipped.
            if let Some(record) = self.get_record(alias).await? {
                metas.push(record.meta());
            }
        }
        Ok(metas)
    }

    /// Fixed-window quota check-and-increment.
    pub async fn increment_usage(&self, alias: &str) -> Result<QuotaDecision, VaultError> {
        let Some(mut record) = self.get_record(alias).await? else {
            return Err(VaultError::NotFound(format!("alias '{alias}' not found")));
        };

        let now = now_ms();
        if now - record.quota_window_start > self.window_ms {
            record.quota_used = 0;
            record.quota_window_start = now;
        }

        if record.quota_used >= record.quota_limit {
            debug!(alias = %alias, "quota exhausted");
            return Ok(QuotaDecision {
                allowed: false,
                remaining: 0,
            });
        }

        record.quota_used += 1;
        self.put_record(&record).await?;

        Ok(QuotaDecision {
            allowed: true,
            remaining: record.quota_limit - record.quota_used,
        })
    }

    /// Number of registered aliases, for the health probe.
    pub async fn count(&self) -> Result<usize, VaultError> {
        Ok(self.load_index().await?.len())
    }

    async fn put_record(&self, record: &CredentialRecord) -> Result<(), VaultError> {
        let json = serde_json::to_string(record)
            .map_err(|e| VaultError::Backend(format!("serialize record: {e}")))?;
        self.backend.set(&record_key(&record.alias), &json).await
    }

    async fn load_index(&self) -> Result<Vec<String>, VaultError> {
        match self.backend.get(INDEX_KEY).await? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| VaultError::Backend(format!("corrupt alias index: {e}"))),
        }
    }

    async fn save_index(&self, index: &[String]) -> Result<(), VaultError> {
        let json = serde_json::to_string(index)
            .map_err(|e| VaultError::Backend(format!("serialize alias index: {e}")))?;
        self.backend.set(INDEX_KEY, &json).await
    }
}

fn parse_record(raw: &str) -> Result<CredentialRecord, VaultError> {
    serde_json::from_str(raw).map_err(|e| VaultError::Backend(format!("corrupt record: {e}")))
}

/// The upstream target must be an absolute URL with a host; a path prefix is
/// allowed.
fn validate_base_url(base_url: &str) -> Result<(), VaultError> {
    let parsed = url::Url::parse(base_url)
        .map_err(|_| VaultError::InvalidInput("base_url must be an absolute URL".into()))?;
    if parsed.host_str().is_none() {
        return Err(VaultError::InvalidInput("base_url must include a host".into()));
    }
    Ok(())
}
