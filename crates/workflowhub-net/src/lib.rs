//! # WorkflowHub Net
//!
//! Request and response model for the WorkflowHub offline layer, plus the
//! network seam the cache worker fetches through.
//!
//! ## Design Goals
//!
//! 1. **Single-consumption bodies**: a [`Response`] body can be read once,
//!    exactly like a browser response stream
//! 2. **Snapshot-then-fork**: one read yields two independent copies, one to
//!    return and one to cache
//! 3. **Pluggable network**: the worker talks to a [`Network`], which is a
//!    reqwest-backed [`ResourceLoader`] in production and a fake in tests

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use url::{Origin, Url};

pub mod loader;
pub mod response;

pub use loader::{LoaderConfig, ResourceLoader};
pub use response::{Response, ResponseBody, ResponseSnapshot, ResponseType};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as seen by a fetch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Loading a top-level document.
    Navigate,
    /// Same-origin only sub-resource.
    SameOrigin,
    /// Opaque cross-origin sub-resource.
    NoCors,
    /// Regular sub-resource.
    #[default]
    Cors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET sub-resource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::Cors,
            body: None,
        }
    }

    /// Create a navigation request for a top-level document.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this request loads a top-level document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Origin of the request target.
    pub fn origin(&self) -> Origin {
        self.url.origin()
    }
}

/// Something that can perform network fetches.
pub trait Network: Send + Sync {
    /// Fetch a request from the network.
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, NetError>> + Send;
}

impl<N: Network> Network for Arc<N> {
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, NetError>> + Send {
        (**self).fetch(request)
    }
}
