//! Remote key-value client.
//!
//! `KvStore` is the seam between the credential store and whatever holds the
//! bytes. The production implementation speaks an Upstash-style REST protocol
//! over HTTPS; `MemoryKvStore` backs tests and local development.
//!
//! Absence is `Ok(None)`. A network or protocol failure is an error — the two
//! must never be conflated, because callers treat them differently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Remote key-value operations: string keys, opaque string values,
/// optional TTL in whole seconds.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// REST client for an Upstash-style key-value service.
///
/// Protocol: `GET {base}/get/{key}` returns `{"result": <value|null>}`;
/// `POST {base}/set/{key}[?ex=ttl]` with the value as the body;
/// `POST {base}/del/{key}`. Every request carries the bearer token.
pub struct HttpKvStore {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

#[derive(Deserialize)]
struct KvResponse {
    result: Option<String>,
}

impl HttpKvStore {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    // Keys derived from base64 material can contain `/` and `+`, which
    // would otherwise change the request path.
    fn url(&self, op: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, op, urlencoding::encode(key))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

#[async_trait]
impl KvStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .http
            .get(self.url("get", key))
            .header("authorization", self.bearer())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::Kv {
                op: "get",
                key: key.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let body: KvResponse = response.json().await?;
        Ok(body.result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut request = self
            .http
            .post(self.url("set", key))
            .header("authorization", self.bearer())
            .body(value.to_string());
        if let Some(ttl) = ttl {
            request = request.query(&[("ex", ttl.as_secs())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Kv {
                op: "set",
                key: key.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.url("del", key))
            .header("authorization", self.bearer())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::Kv {
                op: "del",
                key: key.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Entry in the in-memory store.
#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory `KvStore` with TTL support, for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at.is_none_or(|t| t > Instant::now()) => {
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.write().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
