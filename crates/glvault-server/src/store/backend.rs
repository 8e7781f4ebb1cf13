use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::VaultError;

/// Key-value contract the credential store and audit log consume. Keys live
/// in the reserved `glvault:` namespace; values are opaque strings (in
/// practice serialized JSON records).
///
/// Implementations must be `Send + Sync`; the core holds one behind
/// `Arc<dyn StorageBackend>`, the single dynamic seam.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, VaultError>;

    /// Unconditional overwrite.
    async fn set(&self, key: &str, value: &str) -> Result<(), VaultError>;

    /// Idempotent: deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), VaultError>;

    /// Keys starting with `prefix`. Need not be consistent with concurrent
    /// writes.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, VaultError>;
}

/// In-memory backend for development and unit tests. Holds everything in a
/// `HashMap` behind an `RwLock`; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.inner
            .write()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.inner.write().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
