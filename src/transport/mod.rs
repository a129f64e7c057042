//! Transport layer abstraction for HTTP communication.
//!
//! The default implementation uses reqwest. The retrying transport and the
//! test doubles in [`crate::mocks`] implement the same trait so they can be
//! stacked in any order.

use crate::context::Context;
use crate::errors::{GitHubError, GitHubResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use std::fmt;
use std::io;
use std::time::Duration;
use url::Url;

/// Request body.
pub enum RequestBody {
    /// No body.
    Empty,
    /// In-memory body; can be resent.
    Bytes(Bytes),
    /// Streaming body; readable once.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl RequestBody {
    /// Returns true if the body can be replayed without buffering.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }

    /// In-memory contents, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(body: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(body))
    }
}

impl From<Bytes> for RequestBody {
    fn from(body: Bytes) -> Self {
        Self::Bytes(body)
    }
}

/// Outbound HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: RequestBody,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Copies the request. Fails for streaming bodies.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            RequestBody::Empty => RequestBody::Empty,
            RequestBody::Bytes(bytes) => RequestBody::Bytes(bytes.clone()),
            RequestBody::Stream(_) => return None,
        };
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
        })
    }
}

/// Fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Final URL.
    pub url: Url,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// GitHub request id.
    pub fn request_id(&self) -> Option<String> {
        self.header("x-github-request-id").map(str::to_string)
    }
}

/// Trait for HTTP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request.
    ///
    /// A non-2xx status is not an error at this layer.
    async fn send(&self, ctx: &Context, request: HttpRequest) -> GitHubResult<HttpResponse>;
}

/// Reqwest-based HTTP transport implementation.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with the given timeouts.
    pub fn new(timeout: Duration, connect_timeout: Duration) -> GitHubResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| {
                GitHubError::configuration(format!("Failed to create HTTP client: {}", e))
                    .with_cause(e)
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying reqwest client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn exchange(&self, request: HttpRequest) -> GitHubResult<HttpResponse> {
        let url = request.url.to_string();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| GitHubError::from_reqwest(e).with_url(url.clone()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GitHubError::from_reqwest(e).with_url(url))?;

        Ok(HttpResponse {
            status,
            headers,
            url: final_url,
            body,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, ctx: &Context, request: HttpRequest) -> GitHubResult<HttpResponse> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let result = ctx.run(self.exchange(request)).await?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        result
    }
}
