//! Named caches.
//!
//! ```text
//! CacheStore
//!     └── Cache ("workflowhub-v2")
//!             └── CacheKey (method + URL) → CacheEntry (snapshot)
//! ```

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;
use workflowhub_net::{Request, Response, ResponseSnapshot, ResponseType};

/// Cache storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Normalized request identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    /// Key for a request: method plus URL without fragment.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }
}

/// A stored response snapshot. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub url: Option<Url>,
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub body: Bytes,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a snapshot under `key`.
    pub fn from_snapshot(key: CacheKey, snapshot: ResponseSnapshot) -> Self {
        Self {
            key,
            url: snapshot.url,
            status: snapshot.status,
            headers: snapshot.headers,
            response_type: snapshot.response_type,
            body: snapshot.body,
            cached_at: now_millis(),
        }
    }

    /// The stored snapshot.
    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            body: self.body.clone(),
        }
    }

    /// A fresh live response built from the entry.
    pub fn to_response(&self) -> Response {
        self.snapshot().into_response()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A single named cache.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a key.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous entry for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Storage holding every named cache for an origin.
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if missing.
    fn open(&self, name: &str) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Look up `key` in the named cache.
    fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> impl Future<Output = Result<Option<CacheEntry>, CacheError>> + Send;

    /// Store an entry in the named cache, creating the cache if missing.
    fn put(&self, name: &str, entry: CacheEntry)
        -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Delete a whole cache. Returns whether it existed.
    fn delete_cache(&self, name: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Names of all caches.
    fn cache_names(&self) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;

    /// Keys stored in the named cache.
    fn keys(&self, name: &str) -> impl Future<Output = Result<Vec<CacheKey>, CacheError>> + Send;
}

impl<C: CacheStore> CacheStore for Arc<C> {
    fn open(&self, name: &str) -> impl Future<Output = Result<(), CacheError>> + Send {
        (**self).open(name)
    }

    fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> impl Future<Output = Result<Option<CacheEntry>, CacheError>> + Send {
        (**self).match_in(name, key)
    }

    fn put(
        &self,
        name: &str,
        entry: CacheEntry,
    ) -> impl Future<Output = Result<(), CacheError>> + Send {
        (**self).put(name, entry)
    }

    fn delete_cache(&self, name: &str) -> impl Future<Output = Result<bool, CacheError>> + Send {
        (**self).delete_cache(name)
    }

    fn cache_names(&self) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send {
        (**self).cache_names()
    }

    fn keys(&self, name: &str) -> impl Future<Output = Result<Vec<CacheKey>, CacheError>> + Send {
        (**self).keys(name)
    }
}

/// In-process cache storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl MemoryCacheStore {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }
}

impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let mut caches = self.caches.write().await;
        if !caches.contains_key(name) {
            debug!(cache = %name, "Creating cache");
            caches.insert(name.to_string(), Cache::new(name));
        }
        Ok(())
    }

    async fn match_in(&self, name: &str, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_key(key))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        trace!(cache = %name, url = %entry.key.url, status = entry.status, "Cache put");
        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(entry);
        Ok(())
    }

    async fn delete_cache(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn keys(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
        let caches = self.caches.read().await;
        caches
            .get(name)
            .map(|cache| cache.keys())
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }
}
