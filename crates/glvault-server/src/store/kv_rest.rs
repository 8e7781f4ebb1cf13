//! Networked [`StorageBackend`] speaking the Upstash-style Redis REST
//! protocol: one HTTPS call per operation, bearer-token auth, and a
//! `{"result": ...}` response envelope. Keys pass through byte-for-byte, so
//! the persisted `glvault:` layout is identical across this backend and the
//! in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use super::backend::StorageBackend;
use crate::error::VaultError;

#[derive(Clone)]
pub struct RestKvBackend {
    client: Client,
    base_url: Url,
    token: String,
}

impl RestKvBackend {
    /// `base_url` is the service root (e.g. `https://usw1-example.upstash.io`);
    /// `token` is the service's REST token.
    pub fn new(base_url: &str, token: &str) -> Result<Self, VaultError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| VaultError::Backend(format!("invalid KV_REST_URL: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| VaultError::Backend(format!("build kv client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token: token.to_owned(),
        })
    }

    /// `{base}/{command}/{argument}` with the argument percent-encoded as a
    /// single path segment.
    fn command_url(&self, command: &str, argument: &str) -> Result<Url, VaultError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| VaultError::Backend("KV_REST_URL cannot be a base".into()))?
            .push(command)
            .push(argument);
        Ok(url)
    }

    /// Execute a request and unwrap the `{"result": ...}` envelope.
    async fn result(&self, req: reqwest::RequestBuilder) -> Result<Value, VaultError> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| VaultError::Backend(format!("kv request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VaultError::Backend(format!(
                "kv service returned {status}: {body}"
            )));
        }

        let mut envelope: Value = resp
            .json()
            .await
            .map_err(|e| VaultError::Backend(format!("kv response is not JSON: {e}")))?;
        Ok(envelope
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl StorageBackend for RestKvBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        let url = self.command_url("get", key)?;
        match self.result(self.client.get(url)).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(VaultError::Backend(format!(
                "unexpected kv get result type: {other}"
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), VaultError> {
        let url = self.command_url("set", key)?;
        self.result(self.client.post(url).body(value.to_owned()))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        let url = self.command_url("del", key)?;
        self.result(self.client.post(url)).await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        let url = self.command_url("keys", &format!("{prefix}*"))?;
        match self.result(self.client.get(url)).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(VaultError::Backend(format!(
                "unexpected kv keys result type: {other}"
            ))),
        }
    }
}
