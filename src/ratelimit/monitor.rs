//! Server-reported rate limit tracking.

use crate::clock::Clock;
use crate::context::Context;
use crate::observability::{Metrics, TracingHooks};
use crate::resilience::policy::retry_after;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Header set on responses replayed from an HTTP cache.
const FROM_CACHE_HEADER: &str = "x-from-cache";

/// Last reading of the server-reported quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    /// Quota per window.
    pub limit: i64,
    /// Requests left in the window. Never negative.
    pub remaining: i64,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
    /// When this reading was taken.
    pub last_updated: DateTime<Utc>,
    /// Earliest time a retry is welcome, from `Retry-After`.
    pub retry_at: Option<DateTime<Utc>>,
    /// False until a response carried all three rate-limit headers.
    pub known: bool,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            limit: 0,
            remaining: 0,
            reset_at: DateTime::<Utc>::MIN_UTC,
            last_updated: DateTime::<Utc>::MIN_UTC,
            retry_at: None,
            known: false,
        }
    }
}

/// Tracks the rate limit GitHub reports for one (host, credential, resource).
pub struct RateLimitMonitor {
    resource: String,
    header_prefix: String,
    clock: Arc<dyn Clock>,
    blocking: AtomicBool,
    state: Mutex<RateLimitState>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimitMonitor {
    /// Creates a monitor reading `{header_prefix}RateLimit-*` headers.
    pub fn new(
        resource: impl Into<String>,
        header_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resource: resource.into(),
            header_prefix: header_prefix.into(),
            clock,
            blocking: AtomicBool::new(true),
            state: Mutex::new(RateLimitState::default()),
            metrics: None,
        }
    }

    /// Reports readings and waits into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enables or disables sleeping in [`wait_for_rate_limit`](Self::wait_for_rate_limit).
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// Rate-limit resource bucket name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Copy of the current reading.
    pub fn state(&self) -> RateLimitState {
        self.state.lock().clone()
    }

    fn header_i64(&self, headers: &HeaderMap, suffix: &str) -> Option<i64> {
        let name = format!("{}{}", self.header_prefix, suffix);
        headers.get(name.as_str())?.to_str().ok()?.trim().parse().ok()
    }

    /// Records the rate-limit headers of a response.
    ///
    /// 401 responses and cached replays are ignored: both carry readings that
    /// do not reflect the current quota.
    pub fn update(&self, status: StatusCode, headers: &HeaderMap) {
        if status == StatusCode::UNAUTHORIZED || headers.contains_key(FROM_CACHE_HEADER) {
            return;
        }

        let now = self.clock.now();
        let limit = self.header_i64(headers, "RateLimit-Limit");
        let remaining = self.header_i64(headers, "RateLimit-Remaining");
        let reset = self
            .header_i64(headers, "RateLimit-Reset")
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        let mut state = self.state.lock();
        if let Some(wait) = retry_after(headers, now).filter(|d| !d.is_zero()) {
            state.retry_at = chrono::Duration::from_std(wait).ok().map(|d| now + d);
        }

        let (Some(limit), Some(remaining), Some(reset_at)) = (limit, remaining, reset) else {
            state.known = false;
            return;
        };

        state.limit = limit;
        state.remaining = remaining.max(0);
        state.reset_at = reset_at;
        state.last_updated = now;
        state.known = true;
        let reading = state.clone();
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.record_remaining(reading.remaining);
        }
        TracingHooks::on_rate_limit_update(
            &self.resource,
            reading.limit,
            reading.remaining,
            &reading.reset_at.to_rfc3339(),
        );
    }

    /// How long a caller spending `cost` should wait, if at all.
    pub fn recommended_wait(&self, cost: u32) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock();

        if let Some(retry_at) = state.retry_at.filter(|at| *at > now) {
            return (retry_at - now).to_std().ok();
        }
        if state.known && state.remaining < i64::from(cost) && state.reset_at > now {
            return (state.reset_at - now).to_std().ok();
        }
        None
    }

    /// Sleeps until the quota allows `cost` more points.
    ///
    /// Returns true if a wait was warranted and blocking is enabled. The sleep
    /// ends early when `ctx` does; callers check the context afterwards.
    pub async fn wait_for_rate_limit(&self, ctx: &Context, cost: u32) -> bool {
        let Some(wait) = self.recommended_wait(cost) else {
            return false;
        };
        if !self.blocking.load(Ordering::Relaxed) {
            return false;
        }

        let remaining = self.state.lock().remaining;
        TracingHooks::on_rate_limit_wait(&self.resource, remaining, cost, wait);
        if let Some(metrics) = &self.metrics {
            metrics.record_external_wait(wait);
        }
        if let Err(e) = ctx.sleep(wait).await {
            tracing::debug!(error = %e, resource = %self.resource, "rate limit wait interrupted");
        }
        true
    }
}
