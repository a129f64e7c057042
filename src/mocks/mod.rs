//! Test doubles: a scripted transport and a manual clock.

use crate::clock::Clock;
use crate::context::Context;
use crate::errors::{GitHubError, GitHubResult};
use crate::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// A mock response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Headers.
    pub headers: HashMap<String, String>,
    /// Delay before responding.
    pub delay: Option<std::time::Duration>,
}

impl MockResponse {
    /// Creates a response with an arbitrary status and body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
            delay: None,
        }
    }

    fn api_error(status: u16, message: &str) -> Self {
        Self::new(
            status,
            serde_json::json!({
                "message": message,
                "documentation_url": "https://docs.github.com/rest"
            })
            .to_string(),
        )
    }

    /// Creates a successful response with the given body.
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::new(200, serde_json::to_string(body).unwrap_or_default())
    }

    /// Creates a 304 Not Modified response.
    pub fn not_modified() -> Self {
        Self::new(304, "")
    }

    /// Creates a 404 Not Found response.
    pub fn not_found(message: &str) -> Self {
        Self::api_error(404, message)
    }

    /// Creates a 401 Unauthorized response.
    ///
    /// GitHub reports `remaining=0` on these, which must not be trusted.
    pub fn unauthorized(message: &str) -> Self {
        let reset_at = Utc::now() + Duration::hours(1);
        Self::api_error(401, message).with_rate_limit(60, 0, reset_at.timestamp())
    }

    /// Creates a 403 Forbidden response.
    pub fn forbidden(message: &str) -> Self {
        Self::api_error(403, message)
    }

    /// Creates a primary rate limit response resetting after `reset_in`.
    pub fn rate_limited(reset_in: Duration) -> Self {
        let reset_at = Utc::now() + reset_in;
        Self::api_error(403, "API rate limit exceeded")
            .with_rate_limit(5000, 0, reset_at.timestamp())
    }

    /// Creates a secondary rate limit response asking for `retry_after_secs`.
    pub fn secondary_rate_limited(retry_after_secs: u64) -> Self {
        Self::api_error(403, "You have exceeded a secondary rate limit.")
            .with_header("retry-after", &retry_after_secs.to_string())
    }

    /// Creates a 500 Internal Server Error response.
    pub fn server_error(message: &str) -> Self {
        Self::new(500, serde_json::json!({ "message": message }).to_string())
    }

    /// Creates a GraphQL response envelope.
    pub fn graphql<T: Serialize>(data: &T, errors: Vec<serde_json::Value>) -> Self {
        let mut body = serde_json::json!({ "data": data });
        if !errors.is_empty() {
            body["errors"] = serde_json::Value::Array(errors);
        }
        Self::new(200, body.to_string())
    }

    /// Adds a delay to the response.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Adds a header to the response.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// Adds rate limit headers.
    pub fn with_rate_limit(self, limit: u32, remaining: u32, reset_timestamp: i64) -> Self {
        self.with_header("x-ratelimit-limit", &limit.to_string())
            .with_header("x-ratelimit-remaining", &remaining.to_string())
            .with_header("x-ratelimit-reset", &reset_timestamp.to_string())
    }

    fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

/// A recorded mock request.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Query parameters.
    pub query: Option<String>,
    /// Request headers, lower-cased names.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Option<String>,
}

enum Scripted {
    Response(MockResponse),
    Error(GitHubError),
}

/// Transport answering from a FIFO script and recording every request.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<MockRequest>>,
}

impl MockTransport {
    /// Creates an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push(&self, response: MockResponse) {
        self.script.lock().push_back(Scripted::Response(response));
    }

    /// Queues a transport error.
    pub fn push_error(&self, error: GitHubError) {
        self.script.lock().push_back(Scripted::Error(error));
    }

    /// Recorded requests in order.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Most recent request.
    pub fn last_request(&self) -> Option<MockRequest> {
        self.requests.lock().last().cloned()
    }

    async fn record(&self, request: HttpRequest) -> MockRequest {
        let body = match request.body {
            RequestBody::Empty => None,
            RequestBody::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            RequestBody::Stream(mut stream) => {
                let mut read = Vec::new();
                while let Some(Ok(chunk)) = stream.next().await {
                    read.extend_from_slice(&chunk);
                }
                Some(String::from_utf8_lossy(&read).into_owned())
            }
        };
        let headers = request
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        MockRequest {
            method: request.method.to_string(),
            path: request.url.path().to_string(),
            query: request.url.query().map(str::to_string),
            headers,
            body,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, ctx: &Context, request: HttpRequest) -> GitHubResult<HttpResponse> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let url = request.url.clone();
        let recorded = self.record(request).await;
        let description = format!("{} {}", recorded.method, recorded.path);
        self.requests.lock().push(recorded);

        let next = self.script.lock().pop_front();
        let response = match next {
            Some(Scripted::Response(response)) => response,
            Some(Scripted::Error(error)) => return Err(error),
            None => MockResponse::not_found(&format!("No mock response for {}", description)),
        };

        if let Some(delay) = response.delay {
            ctx.sleep(delay).await?;
        }

        Ok(HttpResponse {
            status: StatusCode::from_u16(response.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: response.header_map(),
            url,
            body: Bytes::from(response.body),
        })
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    /// Sets the clock.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
