//! Fetch policy as pure functions.
//!
//! Each function turns what the worker already knows (the request, a
//! network snapshot, a cache hit) into an [`Effect`]: the response to hand
//! back plus the cache writes to perform. The worker adapter in
//! [`crate::worker`] does the I/O and executes effects; nothing here touches
//! a cache or the network.
//!
//! | Class        | Policy        | Offline behaviour                 |
//! |--------------|---------------|-----------------------------------|
//! | cross-origin | pass-through  | untouched                         |
//! | navigation   | network-first | cached page, then offline page    |
//! | everything   | cache-first   | synthesized 408 `Network error`   |

use http::Method;
use workflowhub_net::{Request, Response, ResponseSnapshot, ResponseType};

use crate::cache::{CacheEntry, CacheKey};
use crate::config::WorkerConfig;
use crate::FetchError;

/// Status of the synthesized response for failed sub-resource fetches.
pub const NETWORK_ERROR_STATUS: u16 = 408;
/// Body of the synthesized response for failed sub-resource fetches.
pub const NETWORK_ERROR_BODY: &str = "Network error";

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Another origin: not intercepted.
    CrossOrigin,
    /// Top-level document load: network-first.
    Navigation,
    /// Everything else on our origin: cache-first.
    Asset,
}

/// Classify a request. Origin is checked before anything else.
pub fn classify(config: &WorkerConfig, request: &Request) -> RequestClass {
    if !config.is_same_origin(&request.url) {
        RequestClass::CrossOrigin
    } else if request.is_navigation() {
        RequestClass::Navigation
    } else {
        RequestClass::Asset
    }
}

/// A pending write into a named cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheWrite {
    pub cache_name: String,
    pub entry: CacheEntry,
}

/// What the worker should do for one request.
#[derive(Debug)]
pub struct Effect {
    pub respond_with: Response,
    pub cache_writes: Vec<CacheWrite>,
}

impl Effect {
    /// Respond without touching the cache.
    pub fn respond(response: Response) -> Self {
        Self {
            respond_with: response,
            cache_writes: Vec::new(),
        }
    }

    fn store(mut self, cache_name: String, entry: CacheEntry) -> Self {
        self.cache_writes.push(CacheWrite { cache_name, entry });
        self
    }
}

/// Only GET responses are read from or written to the cache.
pub fn uses_cache(request: &Request) -> bool {
    request.method == Method::GET
}

/// Whether a sub-resource response may be stored: exactly 200 and not an
/// error-type response.
pub fn is_cacheable(status: u16, response_type: ResponseType) -> bool {
    status == 200 && response_type != ResponseType::Error
}

/// Network-first, network answered: return it and store a copy.
pub fn navigation_from_network(
    config: &WorkerConfig,
    request: &Request,
    snapshot: ResponseSnapshot,
) -> Effect {
    let store = uses_cache(request) && snapshot.response_type != ResponseType::Error;
    let (live, stored) = snapshot.fork();
    let effect = Effect::respond(live);
    if store {
        effect.store(
            config.cache_name(),
            CacheEntry::from_snapshot(CacheKey::for_request(request), stored),
        )
    } else {
        effect
    }
}

/// Network-first, network failed: cached copy of the page, then the offline
/// document. With neither there is nothing left to fall back to.
pub fn navigation_fallback(
    request: &Request,
    cached: Option<CacheEntry>,
    offline: Option<CacheEntry>,
) -> Result<Effect, FetchError> {
    cached
        .or(offline)
        .map(|entry| Effect::respond(entry.to_response()))
        .ok_or_else(|| FetchError::NoFallback(request.url.to_string()))
}

/// Cache-first, cache hit.
pub fn asset_from_cache(entry: &CacheEntry) -> Effect {
    Effect::respond(entry.to_response())
}

/// Cache-first, network answered. Stored only if cacheable; always returned.
pub fn asset_from_network(
    config: &WorkerConfig,
    request: &Request,
    snapshot: ResponseSnapshot,
) -> Effect {
    if !uses_cache(request) || !is_cacheable(snapshot.status, snapshot.response_type) {
        return Effect::respond(snapshot.into_response());
    }
    let (live, stored) = snapshot.fork();
    Effect::respond(live).store(
        config.cache_name(),
        CacheEntry::from_snapshot(CacheKey::for_request(request), stored),
    )
}

/// Cache-first, network failed: a placeholder instead of an error.
pub fn asset_network_failure() -> Effect {
    Effect::respond(Response::text(NETWORK_ERROR_STATUS, NETWORK_ERROR_BODY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use url::Url;

    fn config() -> WorkerConfig {
        WorkerConfig::new(Url::parse("https://app.workflowhub.test").unwrap(), "v1")
    }

    fn url(path: &str) -> Url {
        config().resolve(path).unwrap()
    }

    fn snapshot(status: u16, response_type: ResponseType, body: &'static str) -> ResponseSnapshot {
        ResponseSnapshot {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn cached(path: &str, body: &'static str) -> CacheEntry {
        CacheEntry::from_snapshot(
            CacheKey::get(&url(path)),
            snapshot(200, ResponseType::Basic, body),
        )
    }

    #[test]
    fn test_classify() {
        let config = config();
        let cross = Request::navigate(Url::parse("https://accounts.example.com/login").unwrap());
        assert_eq!(classify(&config, &cross), RequestClass::CrossOrigin);
        assert_eq!(
            classify(&config, &Request::navigate(url("/dashboard"))),
            RequestClass::Navigation
        );
        assert_eq!(
            classify(&config, &Request::get(url("/assets/app.js"))),
            RequestClass::Asset
        );
    }

    #[tokio::test]
    async fn test_navigation_from_network_stores_copy() {
        let config = config();
        let request = Request::navigate(url("/tasks"));
        let effect = navigation_from_network(
            &config,
            &request,
            snapshot(200, ResponseType::Basic, "<html>tasks</html>"),
        );

        assert_eq!(effect.cache_writes.len(), 1);
        let write = &effect.cache_writes[0];
        assert_eq!(write.cache_name, "workflowhub-v1");
        assert_eq!(write.entry.key, CacheKey::for_request(&request));
        assert_eq!(write.entry.body, Bytes::from_static(b"<html>tasks</html>"));
        assert_eq!(
            effect.respond_with.text_body().await.unwrap(),
            "<html>tasks</html>"
        );
    }

    #[tokio::test]
    async fn test_navigation_fallback_prefers_cached_page() {
        let request = Request::navigate(url("/tasks"));
        let effect = navigation_fallback(
            &request,
            Some(cached("/tasks", "cached tasks")),
            Some(cached("/offline.html", "offline")),
        )
        .unwrap();
        assert_eq!(effect.respond_with.text_body().await.unwrap(), "cached tasks");
        assert!(effect.cache_writes.is_empty());
    }

    #[tokio::test]
    async fn test_navigation_fallback_uses_offline_document() {
        let request = Request::navigate(url("/tasks"));
        let effect =
            navigation_fallback(&request, None, Some(cached("/offline.html", "offline"))).unwrap();
        assert_eq!(effect.respond_with.text_body().await.unwrap(), "offline");
    }

    #[test]
    fn test_navigation_fallback_without_anything_fails() {
        let request = Request::navigate(url("/tasks"));
        assert!(matches!(
            navigation_fallback(&request, None, None),
            Err(FetchError::NoFallback(_))
        ));
    }

    #[test]
    fn test_asset_from_network_caches_success() {
        let config = config();
        let request = Request::get(url("/app.js"));
        let effect = asset_from_network(&config, &request, snapshot(200, ResponseType::Basic, "js"));
        assert_eq!(effect.cache_writes.len(), 1);
        assert_eq!(effect.respond_with.status, 200);
    }

    #[test]
    fn test_asset_from_network_skips_non_cacheable() {
        let config = config();
        let request = Request::get(url("/app.js"));

        for (status, kind) in [
            (404, ResponseType::Basic),
            (500, ResponseType::Basic),
            (204, ResponseType::Basic),
            (200, ResponseType::Error),
        ] {
            let effect = asset_from_network(&config, &request, snapshot(status, kind, ""));
            assert!(effect.cache_writes.is_empty(), "status {status} was cached");
            assert_eq!(effect.respond_with.status, status);
        }
    }

    #[test]
    fn test_asset_from_network_never_caches_post() {
        let config = config();
        let request = Request::get(url("/api/invoices")).method(Method::POST);
        let effect = asset_from_network(&config, &request, snapshot(200, ResponseType::Basic, "{}"));
        assert!(effect.cache_writes.is_empty());
    }

    #[tokio::test]
    async fn test_asset_network_failure_is_408() {
        let effect = asset_network_failure();
        let response = effect.respond_with;
        assert_eq!(response.status, 408);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.text_body().await.unwrap(), "Network error");
    }

    #[tokio::test]
    async fn test_asset_from_cache() {
        let entry = cached("/app.css", "css");
        let effect = asset_from_cache(&entry);
        assert!(effect.cache_writes.is_empty());
        assert_eq!(effect.respond_with.text_body().await.unwrap(), "css");
    }
}
