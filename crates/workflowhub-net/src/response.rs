//! Responses with single-consumption bodies.
//!
//! A [`Response`] body is read at most once. Anything that needs the body
//! twice (return it to the page *and* store it in a cache) must take a
//! [`ResponseSnapshot`] first and [`fork`](ResponseSnapshot::fork) it.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use url::Url;

use crate::NetError;

/// Response type, mirroring the fetch `Response.type` classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with CORS headers.
    Cors,
    /// Cross-origin no-cors response.
    Opaque,
    /// Network error.
    Error,
}

/// Response body variants.
#[derive(Debug)]
pub enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

/// A live response. Not `Clone`: the body can be consumed once.
#[derive(Debug)]
pub struct Response {
    pub url: Option<Url>,
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: ResponseBody,
}

impl Response {
    /// Create a basic response with a full body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: ResponseBody::Full(body.into()),
        }
    }

    /// Create a `text/plain` response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut response = Self::new(status, Bytes::from(body.into()));
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    /// Create a network-error response (type `Error`, status 0).
    pub fn error() -> Self {
        Self {
            url: None,
            status: 0,
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            body: ResponseBody::Empty,
        }
    }

    /// Create a response whose body arrives over a channel.
    pub fn streaming(status: u16, rx: mpsc::Receiver<Result<Bytes, NetError>>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: ResponseBody::Stream(rx),
        }
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Replace the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as bytes, consuming the response.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        read_body(self.body).await
    }

    /// Get the body as text, consuming the response.
    pub async fn text_body(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Read the body once and capture everything into a snapshot.
    pub async fn snapshot(self) -> Result<ResponseSnapshot, NetError> {
        let body = read_body(self.body).await?;
        Ok(ResponseSnapshot {
            url: self.url,
            status: self.status,
            headers: self.headers,
            response_type: self.response_type,
            body,
        })
    }
}

async fn read_body(body: ResponseBody) -> Result<Bytes, NetError> {
    match body {
        ResponseBody::Full(b) => Ok(b),
        ResponseBody::Stream(mut rx) => {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk?);
            }
            Ok(chunks.into_iter().flatten().collect())
        }
        ResponseBody::Empty => Ok(Bytes::new()),
    }
}

/// A fully-read response. Cheap to clone; every copy is independent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSnapshot {
    pub url: Option<Url>,
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub body: Bytes,
}

impl ResponseSnapshot {
    /// Split into a live response for the caller and a stored copy.
    pub fn fork(self) -> (Response, ResponseSnapshot) {
        let stored = self.clone();
        (self.into_response(), stored)
    }

    /// Rebuild a live response from the snapshot.
    pub fn into_response(self) -> Response {
        Response {
            url: self.url,
            status: self.status,
            headers: self.headers,
            response_type: self.response_type,
            body: ResponseBody::Full(self.body),
        }
    }

    /// Check if status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
