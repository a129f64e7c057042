//! Replay-safe retrying transport.

use super::policy::{Attempt, RetryPolicy};
use crate::context::Context;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::observability::{Metrics, TracingHooks};
use crate::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use std::sync::Arc;

/// Transport wrapper that resends failed attempts according to a [`RetryPolicy`].
///
/// The cap on attempts lives in the policy; this loop only asks it.
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl RetryingTransport {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Records retries into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

enum Buffered {
    /// Body fully in memory.
    Replayable(HttpRequest),
    /// Body failed mid-read; the request carries what was read plus the failure.
    SendOnce(HttpRequest),
}

async fn buffer_body(ctx: &Context, mut request: HttpRequest) -> GitHubResult<Buffered> {
    let RequestBody::Stream(mut body) = std::mem::take(&mut request.body) else {
        return Ok(Buffered::Replayable(request));
    };

    let read = ctx
        .run(async {
            let mut chunks: Vec<Bytes> = Vec::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => chunks.push(bytes),
                    Err(e) => return Err((chunks, e)),
                }
            }
            Ok(chunks)
        })
        .await?;

    match read {
        Ok(chunks) => {
            let mut buffer = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks {
                buffer.extend_from_slice(&chunk);
            }
            request.body = RequestBody::Bytes(buffer.freeze());
            Ok(Buffered::Replayable(request))
        }
        Err((chunks, e)) => {
            tracing::debug!(error = %e, "request body could not be buffered; sending once");
            let replay = stream::iter(chunks.into_iter().map(Ok).chain(std::iter::once(Err(e))));
            request.body = RequestBody::Stream(replay.boxed());
            Ok(Buffered::SendOnce(request))
        }
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    async fn send(&self, ctx: &Context, request: HttpRequest) -> GitHubResult<HttpResponse> {
        let request = match buffer_body(ctx, request).await? {
            Buffered::Replayable(request) => request,
            Buffered::SendOnce(request) => return self.inner.send(ctx, request).await,
        };

        let mut index = 0u32;
        loop {
            let Some(outgoing) = request.try_clone() else {
                return Err(GitHubError::new(
                    GitHubErrorKind::Unknown,
                    "buffered request body is not replayable",
                ));
            };
            let result = self.inner.send(ctx, outgoing).await;

            if let Some(err) = ctx.err() {
                return Err(err.with_attempts(index + 1));
            }

            let (response, error) = match &result {
                Ok(response) => (Some(response), None),
                Err(error) => (None, Some(error)),
            };
            let decision = self.policy.decide(&Attempt {
                index,
                request: &request,
                response,
                error,
            });

            if !decision.retry {
                return result.map_err(|e| e.with_attempts(index + 1));
            }

            // Discard the failed response before backing off.
            drop(result);

            TracingHooks::on_retry(
                request.method.as_str(),
                request.url.as_str(),
                index + 1,
                decision.delay,
            );
            self.metrics.record_transport_retry();

            ctx.sleep(decision.delay)
                .await
                .map_err(|e| e.with_attempts(index + 1))?;
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockResponse, MockTransport};
    use reqwest::Method;
    use std::io;
    use std::time::Duration;
    use url::Url;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retry_after: Duration::from_secs(3),
        }
    }

    fn post(body: impl Into<RequestBody>) -> HttpRequest {
        HttpRequest::new(
            Method::POST,
            Url::parse("https://api.github.com/repos/o/r/issues").unwrap(),
        )
        .with_body(body)
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::server_error("boom"));
        mock.push(MockResponse::server_error("boom"));
        mock.push(MockResponse::ok(&serde_json::json!({"id": 1})));

        let transport = RetryingTransport::new(mock.clone(), fast_policy(3));
        let response = transport
            .send(&Context::background(), post(b"{\"title\":\"x\"}".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn test_streamed_body_is_replayed_byte_identical() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::server_error("boom"));
        mock.push(MockResponse::ok(&serde_json::json!({})));

        let chunks = vec![
            Ok::<_, io::Error>(Bytes::from_static(b"{\"title\":")),
            Ok(Bytes::from_static(b"\"hello\"}")),
        ];
        let transport = RetryingTransport::new(mock.clone(), fast_policy(3));
        transport
            .send(
                &Context::background(),
                post(RequestBody::Stream(stream::iter(chunks).boxed())),
            )
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body, requests[1].body);
        assert_eq!(requests[0].body.as_deref(), Some("{\"title\":\"hello\"}"));
        assert_eq!(requests[0].path, requests[1].path);
    }

    #[tokio::test]
    async fn test_unbufferable_body_is_sent_once() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::server_error("boom"));
        mock.push(MockResponse::ok(&serde_json::json!({})));

        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated")),
        ];
        let transport = RetryingTransport::new(mock.clone(), fast_policy(3));
        let response = transport
            .send(
                &Context::background(),
                post(RequestBody::Stream(stream::iter(chunks).boxed())),
            )
            .await
            .unwrap();

        assert_eq!(response.status.as_u16(), 500);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_network_error_carries_attempts() {
        let mock = Arc::new(MockTransport::new());
        for _ in 0..3 {
            mock.push_error(GitHubError::new(GitHubErrorKind::ConnectionFailed, "refused"));
        }

        let transport = RetryingTransport::new(mock.clone(), fast_policy(2));
        let err = transport
            .send(&Context::background(), post(Vec::new()))
            .await
            .unwrap_err();

        assert_eq!(*err.kind(), GitHubErrorKind::ConnectionFailed);
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_status_returned_as_is() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::not_found("Not Found"));

        let transport = RetryingTransport::new(mock.clone(), fast_policy(3));
        let response = transport
            .send(&Context::background(), post(Vec::new()))
            .await
            .unwrap();

        assert_eq!(response.status.as_u16(), 404);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_backoff_returns_promptly() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::server_error("boom"));
        mock.push(MockResponse::ok(&serde_json::json!({})));

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(30),
        };
        let transport = RetryingTransport::new(mock.clone(), policy);
        let ctx = Context::background();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = transport.send(&ctx, post(Vec::new())).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mock.request_count(), 1);
    }
}
