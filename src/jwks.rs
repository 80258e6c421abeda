//! Resolution of the identity provider's public signing keys.
//!
//! The pool publishes its keys at `<issuer>/.well-known/jwks.json`. Keys are
//! cached by key id for the process lifetime; a kid we have never seen forces
//! one refetch of the whole set, which is how key rotation is absorbed.
//! Correctness never depends on the cache — every token signature is
//! re-verified against the resolved key.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum KeyResolutionError {
    #[error("no key published for kid {0}")]
    UnknownKeyId(String),

    #[error("JWKS fetch failed: {0}")]
    Fetch(String),
}

/// Public RSA key material of one published key, base64url-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct JwkKey {
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<JwkKey>, KeyResolutionError>;
}

pub struct HttpJwksFetcher {
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpJwksFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<JwkKey>, KeyResolutionError> {
        let doc: JwksDocument = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| KeyResolutionError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| KeyResolutionError::Fetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| KeyResolutionError::Fetch(e.to_string()))?;
        Ok(doc.keys)
    }
}

#[derive(Clone)]
pub struct KeyResolver {
    jwks_url: String,
    fetcher: Arc<dyn JwksFetcher>,
    cache: Arc<RwLock<HashMap<String, JwkKey>>>,
}

impl KeyResolver {
    pub fn new(jwks_url: String) -> Self {
        Self::with_fetcher(jwks_url, Arc::new(HttpJwksFetcher::new()))
    }

    pub fn with_fetcher(jwks_url: String, fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self {
            jwks_url,
            fetcher,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return the key material for `kid`, refetching the published set once
    /// on a cache miss.
    pub async fn resolve(&self, kid: &str) -> Result<JwkKey, KeyResolutionError> {
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.get(kid) {
                return Ok(key.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(key) = cache.get(kid) {
            return Ok(key.clone());
        }

        let keys = self.fetcher.fetch(&self.jwks_url).await?;
        tracing::debug!(count = keys.len(), url = %self.jwks_url, "refreshed signing key set");
        *cache = keys.into_iter().map(|k| (k.kid.clone(), k)).collect();

        cache
            .get(kid)
            .cloned()
            .ok_or_else(|| KeyResolutionError::UnknownKeyId(kid.to_string()))
    }
}
