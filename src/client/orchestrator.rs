//! Per-call request lifecycle.
//!
//! One logical call runs: throttle acquire, internal limiter wait, preflight
//! quota wait, send through the retrying transport, and a bounded number of
//! resends for 403s that look like rate limiting. The throttle is released on
//! every exit path.

use crate::config::RateLimitConfig;
use crate::context::Context;
use crate::errors::{ApiError, GitHubError, GitHubErrorKind, GitHubResult};
use crate::observability::{Metrics, RequestTimer, TracingHooks};
use crate::ratelimit::{InternalLimiter, RateLimitMonitor};
use crate::resilience::throttle::{ConcurrencyThrottle, ThrottlePermit};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Instant;

/// What differs between REST and GraphQL calls.
pub trait RequestStrategy: Send + Sync {
    /// Decoded result of a successful call.
    type Output;

    /// Builds the request. Called once per logical call.
    fn build_request(&self) -> GitHubResult<HttpRequest>;

    /// Points charged against both limiters.
    fn cost(&self) -> u32;

    /// Decodes a response with a successful (or 304) status.
    fn interpret_response(&self, response: HttpResponse) -> GitHubResult<Self::Output>;
}

/// Rate-limit state a call runs against.
pub struct CallScope<'a> {
    /// One-way hash of the credential. Keys the throttle and internal limiter.
    pub credential_hash: &'a str,
    /// Server-reported quota for this (host, credential, resource).
    pub monitor: &'a RateLimitMonitor,
}

/// Drives logical calls through the shared resilience components.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    internal: Arc<InternalLimiter>,
    throttle: Arc<dyn ConcurrencyThrottle>,
    metrics: Arc<Metrics>,
    rate_limit: RateLimitConfig,
}

impl Orchestrator {
    /// Creates an orchestrator. `transport` is expected to retry on its own.
    pub fn new(
        transport: Arc<dyn Transport>,
        internal: Arc<InternalLimiter>,
        throttle: Arc<dyn ConcurrencyThrottle>,
        metrics: Arc<Metrics>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            transport,
            internal,
            throttle,
            metrics,
            rate_limit,
        }
    }

    /// Rate-limit settings in effect.
    pub fn rate_limit_config(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    /// Runs one logical call.
    pub async fn execute<S: RequestStrategy>(
        &self,
        ctx: &Context,
        scope: CallScope<'_>,
        strategy: &S,
    ) -> GitHubResult<S::Output> {
        let timer = RequestTimer::new(Arc::clone(&self.metrics));
        let permit = ThrottlePermit::acquire(
            Arc::clone(&self.throttle),
            ctx,
            scope.credential_hash,
            &self.metrics,
        )
        .await;

        let result = self.drive(ctx, &scope, strategy).await;
        permit.release().await;

        let result = result.map_err(|e| ctx.err().unwrap_or(e));
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    async fn drive<S: RequestStrategy>(
        &self,
        ctx: &Context,
        scope: &CallScope<'_>,
        strategy: &S,
    ) -> GitHubResult<S::Output> {
        let cost = strategy.cost();

        let started = Instant::now();
        if let Err(e) = self.internal.wait(ctx, scope.credential_hash, cost).await {
            if !e.is_cancelled() {
                tracing::warn!(cost = cost, error = %e, "internal rate limiter refused request");
            }
            return Err(e);
        }
        self.metrics.record_internal_wait(started.elapsed());

        if self.rate_limit.wait_for_rate_limit {
            // Precautionary only; a false return is not an error.
            scope.monitor.wait_for_rate_limit(ctx, cost).await;
        }
        if let Some(e) = ctx.err() {
            return Err(e);
        }

        let mut request = strategy.build_request()?;
        let mut rate_limit_retries = 0;
        loop {
            let replay = request.try_clone();
            let method = request.method.to_string();
            let url = request.url.to_string();

            TracingHooks::on_request_start(&method, &url, &request.headers);
            let started = Instant::now();
            let sent = self.transport.send(ctx, request).await;
            if let Some(e) = ctx.err() {
                // The request may have completed; its result is discarded.
                return Err(e);
            }
            let response = sent?;
            TracingHooks::on_request_complete(
                &method,
                &url,
                response.status.as_u16(),
                started.elapsed(),
            );

            scope.monitor.update(response.status, &response.headers);

            if response.status == StatusCode::NOT_MODIFIED || !is_error_status(response.status) {
                return strategy.interpret_response(response);
            }

            let error = api_error(&response);
            if response.status != StatusCode::FORBIDDEN
                || !self.rate_limit.wait_for_rate_limit
                || rate_limit_retries >= self.rate_limit.max_rate_limit_retries
            {
                return Err(error);
            }
            if !scope.monitor.wait_for_rate_limit(ctx, cost).await {
                return Err(error);
            }
            if let Some(e) = ctx.err() {
                return Err(e);
            }
            let Some(next) = replay else {
                return Err(error);
            };

            rate_limit_retries += 1;
            self.metrics.record_rate_limit_retry();
            TracingHooks::on_rate_limit_retry(
                &url,
                rate_limit_retries,
                self.rate_limit.max_rate_limit_retries,
            );
            request = next;
        }
    }
}

fn is_error_status(status: StatusCode) -> bool {
    status.as_u16() < 200 || status.as_u16() >= 400
}

/// Builds the error for a non-success response.
fn api_error(response: &HttpResponse) -> GitHubError {
    GitHubError::from_api_error(
        response.url.as_str(),
        response.status.as_u16(),
        ApiError::from_body(&response.body),
        response.request_id(),
    )
}

/// Convenience for strategies decoding JSON bodies.
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    response: &HttpResponse,
) -> GitHubResult<T> {
    serde_json::from_slice(&response.body).map_err(|e| {
        GitHubError::new(
            GitHubErrorKind::DeserializationError,
            format!("decoding response from {}: {}", response.url, e),
        )
        .with_status(response.status.as_u16())
        .with_url(response.url.as_str())
        .with_cause(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::resilience::throttle::{lock_name, LockHandle, MockConcurrencyThrottle};
    use crate::resilience::{InProcessThrottle, RetryPolicy, RetryingTransport};
    use bytes::Bytes;
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    struct Echo {
        url: Url,
        cost: u32,
    }

    impl RequestStrategy for Echo {
        type Output = serde_json::Value;

        fn build_request(&self) -> GitHubResult<HttpRequest> {
            Ok(HttpRequest::new(Method::POST, self.url.clone())
                .with_body(Bytes::from_static(br#"{"hello":"world"}"#)))
        }

        fn cost(&self) -> u32 {
            self.cost
        }

        fn interpret_response(&self, response: HttpResponse) -> GitHubResult<Self::Output> {
            if response.status == StatusCode::NOT_MODIFIED {
                return Ok(serde_json::Value::Null);
            }
            decode_json(&response)
        }
    }

    fn echo() -> Echo {
        Echo {
            url: Url::parse("https://api.github.com/echo").unwrap(),
            cost: 1,
        }
    }

    fn orchestrator(
        mock: Arc<MockTransport>,
        throttle: Arc<dyn ConcurrencyThrottle>,
        rate_limit: RateLimitConfig,
    ) -> (Orchestrator, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let transport = RetryingTransport::new(mock, RetryPolicy::none()).with_metrics(metrics.clone());
        let orchestrator = Orchestrator::new(
            Arc::new(transport),
            Arc::new(InternalLimiter::new(100, 10.0).unwrap()),
            throttle,
            metrics.clone(),
            rate_limit,
        );
        (orchestrator, metrics)
    }

    fn monitor() -> RateLimitMonitor {
        RateLimitMonitor::new("rest", "X-", Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_success_records_metrics() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::ok(&json!({"ok": true})).with_rate_limit(5000, 4999, 4102444800));
        let (orchestrator, metrics) =
            orchestrator(mock.clone(), Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();

        let value = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(monitor.state().remaining, 4999);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.lock_waits, 1);
        assert_eq!(snapshot.last_remaining, Some(4999));
    }

    #[tokio::test]
    async fn test_not_modified_is_success() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::not_modified());
        let (orchestrator, _) =
            orchestrator(mock, Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();

        let value = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap();
        assert_eq!(value, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::unauthorized("Bad credentials"));
        let (orchestrator, metrics) =
            orchestrator(mock.clone(), Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();

        let err = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(err.message(), "Bad credentials");
        assert_eq!(mock.request_count(), 1);
        assert!(!monitor.state().known);
        assert_eq!(metrics.rate_limit_retries(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_without_rate_limit_signal_fails_fast() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::forbidden("Resource not accessible by integration"));
        let (orchestrator, _) =
            orchestrator(mock.clone(), Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();

        let err = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap_err();

        assert!(err.is_forbidden());
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_secondary_limit_is_resent_identically() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::secondary_rate_limited(1));
        mock.push(MockResponse::ok(&json!({"ok": true})));
        let (orchestrator, metrics) =
            orchestrator(mock.clone(), Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();

        orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, requests[1].path);
        assert_eq!(requests[0].body, requests[1].body);
        assert_eq!(metrics.rate_limit_retries(), 1);
    }

    #[tokio::test]
    async fn test_lock_failure_does_not_fail_the_call() {
        let mut throttle = MockConcurrencyThrottle::new();
        throttle.expect_acquire().returning(|_, _| {
            Err(GitHubError::new(GitHubErrorKind::LockUnavailable, "down"))
        });
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::ok(&json!({})));
        let (orchestrator, metrics) =
            orchestrator(mock, Arc::new(throttle), RateLimitConfig::default());
        let monitor = monitor();

        orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().lock_failures, 1);
    }

    #[tokio::test]
    async fn test_lock_released_on_error() {
        let mut throttle = MockConcurrencyThrottle::new();
        throttle
            .expect_acquire()
            .times(1)
            .returning(|_, hash| Ok(LockHandle::remote(lock_name(hash), "t")));
        throttle.expect_release().times(1).returning(|_| Ok(()));
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::not_found("Not Found"));
        let (orchestrator, _) = orchestrator(mock, Arc::new(throttle), RateLimitConfig::default());
        let monitor = monitor();

        let err = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_context_wins() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockResponse::ok(&json!({})).with_delay(Duration::from_millis(200)));
        let (orchestrator, _) =
            orchestrator(mock, Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let err = orchestrator
            .execute(
                &ctx,
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &echo(),
            )
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), GitHubErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_cost_above_internal_bucket_fails() {
        let mock = Arc::new(MockTransport::new());
        let (orchestrator, _) =
            orchestrator(mock.clone(), Arc::new(InProcessThrottle::new()), RateLimitConfig::default());
        let monitor = monitor();
        let strategy = Echo { cost: 1000, ..echo() };

        let err = orchestrator
            .execute(
                &Context::background(),
                CallScope {
                    credential_hash: "abc",
                    monitor: &monitor,
                },
                &strategy,
            )
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), GitHubErrorKind::InternalRateLimitExceeded);
        assert_eq!(mock.request_count(), 0);
    }
}
