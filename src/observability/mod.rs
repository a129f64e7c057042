//! Observability module providing metrics and tracing hooks.

use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Metrics collector for resilience events.
#[derive(Debug)]
pub struct Metrics {
    /// Logical calls started.
    requests_total: AtomicU64,
    /// Logical calls that returned a response.
    requests_success: AtomicU64,
    /// Logical calls that returned an error.
    requests_failed: AtomicU64,
    /// Transport-level resends.
    transport_retries: AtomicU64,
    /// Orchestrator-level resends after a rate-limit wait.
    rate_limit_retries: AtomicU64,
    /// Throttle acquisitions.
    lock_waits: AtomicU64,
    /// Total time spent acquiring the throttle in microseconds.
    lock_wait_total_us: AtomicU64,
    /// Throttle acquisitions that failed and proceeded unlocked.
    lock_failures: AtomicU64,
    /// Internal limiter waits.
    internal_waits: AtomicU64,
    /// Total time spent in the internal limiter in microseconds.
    internal_wait_total_us: AtomicU64,
    /// External limiter waits that actually slept.
    external_waits: AtomicU64,
    /// Total time slept by the external limiter in microseconds.
    external_wait_total_us: AtomicU64,
    /// Last server-reported remaining quota, -1 before the first reading.
    last_remaining: AtomicI64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            transport_retries: AtomicU64::new(0),
            rate_limit_retries: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            lock_wait_total_us: AtomicU64::new(0),
            lock_failures: AtomicU64::new(0),
            internal_waits: AtomicU64::new(0),
            internal_wait_total_us: AtomicU64::new(0),
            external_waits: AtomicU64::new(0),
            external_wait_total_us: AtomicU64::new(0),
            last_remaining: AtomicI64::new(-1),
        }
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a logical call.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transport-level retry.
    pub fn record_transport_retry(&self) {
        self.transport_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rate-limit resend.
    pub fn record_rate_limit_retry(&self) {
        self.rate_limit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records time spent acquiring the throttle.
    pub fn record_lock_wait(&self, waited: Duration) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
        self.lock_wait_total_us.fetch_add(micros(waited), Ordering::Relaxed);
    }

    /// Records a throttle acquisition failure.
    pub fn record_lock_failure(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records time spent in the internal limiter.
    pub fn record_internal_wait(&self, waited: Duration) {
        self.internal_waits.fetch_add(1, Ordering::Relaxed);
        self.internal_wait_total_us.fetch_add(micros(waited), Ordering::Relaxed);
    }

    /// Records a sleep imposed by server-reported limits.
    pub fn record_external_wait(&self, waited: Duration) {
        self.external_waits.fetch_add(1, Ordering::Relaxed);
        self.external_wait_total_us.fetch_add(micros(waited), Ordering::Relaxed);
    }

    /// Records the latest server-reported remaining quota.
    pub fn record_remaining(&self, remaining: i64) {
        self.last_remaining.store(remaining, Ordering::Relaxed);
    }

    /// Gets the total call count.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Gets the transport retry count.
    pub fn transport_retries(&self) -> u64 {
        self.transport_retries.load(Ordering::Relaxed)
    }

    /// Gets the rate-limit resend count.
    pub fn rate_limit_retries(&self) -> u64 {
        self.rate_limit_retries.load(Ordering::Relaxed)
    }

    /// Last server-reported remaining quota, if any was seen.
    pub fn last_remaining(&self) -> Option<i64> {
        match self.last_remaining.load(Ordering::Relaxed) {
            r if r < 0 => None,
            r => Some(r),
        }
    }

    /// Gets a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.total_requests(),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            transport_retries: self.transport_retries(),
            rate_limit_retries: self.rate_limit_retries(),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_wait_total: Duration::from_micros(self.lock_wait_total_us.load(Ordering::Relaxed)),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            internal_waits: self.internal_waits.load(Ordering::Relaxed),
            internal_wait_total: Duration::from_micros(
                self.internal_wait_total_us.load(Ordering::Relaxed),
            ),
            external_waits: self.external_waits.load(Ordering::Relaxed),
            external_wait_total: Duration::from_micros(
                self.external_wait_total_us.load(Ordering::Relaxed),
            ),
            last_remaining: self.last_remaining(),
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Logical calls started.
    pub requests_total: u64,
    /// Successful calls.
    pub requests_success: u64,
    /// Failed calls.
    pub requests_failed: u64,
    /// Transport-level resends.
    pub transport_retries: u64,
    /// Rate-limit resends.
    pub rate_limit_retries: u64,
    /// Throttle acquisitions.
    pub lock_waits: u64,
    /// Time spent acquiring the throttle.
    pub lock_wait_total: Duration,
    /// Failed throttle acquisitions.
    pub lock_failures: u64,
    /// Internal limiter waits.
    pub internal_waits: u64,
    /// Time spent in the internal limiter.
    pub internal_wait_total: Duration,
    /// External limiter sleeps.
    pub external_waits: u64,
    /// Time slept by the external limiter.
    pub external_wait_total: Duration,
    /// Last server-reported remaining quota.
    pub last_remaining: Option<i64>,
}

/// Request timer for a logical call.
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    /// Creates a new request timer.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_request();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    /// Records success.
    pub fn success(self) {
        self.metrics.record_success();
    }

    /// Records failure.
    pub fn failure(self) {
        self.metrics.record_failure();
    }

    /// Gets elapsed time without recording.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Tracing hooks for the request lifecycle.
pub struct TracingHooks;

impl TracingHooks {
    /// Logs the start of an API request.
    ///
    /// Header values pass through [`redact_header`].
    pub fn on_request_start(method: &str, url: &str, headers: &HeaderMap) {
        debug!(
            method = %method,
            url = %url,
            headers = ?redacted_headers(headers),
            "GitHub API request started"
        );
    }

    /// Logs the completion of an API request.
    pub fn on_request_complete(method: &str, url: &str, status: u16, duration: Duration) {
        info!(
            method = %method,
            url = %url,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "GitHub API request completed"
        );
    }

    /// Logs a transport-level retry.
    pub fn on_retry(method: &str, url: &str, attempt: u32, delay: Duration) {
        warn!(
            method = %method,
            url = %url,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying GitHub API request"
        );
    }

    /// Logs a resend after a rate-limit wait.
    pub fn on_rate_limit_retry(url: &str, retry: u32, max: u32) {
        warn!(url = %url, retry = retry, max_retries = max, "Resending after rate limit wait");
    }

    /// Logs a rate limit reading.
    pub fn on_rate_limit_update(resource: &str, limit: i64, remaining: i64, reset_at: &str) {
        debug!(
            resource = %resource,
            limit = limit,
            remaining = remaining,
            reset_at = %reset_at,
            "Rate limit updated"
        );
    }

    /// Logs a wait for the server-reported quota.
    pub fn on_rate_limit_wait(resource: &str, remaining: i64, cost: u32, wait: Duration) {
        warn!(
            resource = %resource,
            remaining = remaining,
            cost = cost,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit reset"
        );
    }

    /// Logs a best-effort throttle acquisition failure.
    pub fn on_lock_failure(lock: &str, error: &str) {
        warn!(lock = %lock, error = %error, "Failed to acquire concurrency lock, proceeding without it");
    }

    /// Logs a best-effort throttle release failure.
    pub fn on_unlock_failure(lock: &str, error: &str) {
        warn!(lock = %lock, error = %error, "Failed to release concurrency lock");
    }
}

/// Headers whose values never reach the logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-github-token",
    "cookie",
    "set-cookie",
];

/// Value of `name` as it may be logged.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
    {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Name/value pairs of `headers` with sensitive values redacted.
pub fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("<binary>");
            (name.as_str().to_string(), redact_header(name.as_str(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_request();
        metrics.record_request();
        metrics.record_success();
        metrics.record_failure();
        metrics.record_transport_retry();
        metrics.record_lock_wait(Duration::from_millis(3));
        metrics.record_lock_wait(Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.transport_retries, 1);
        assert_eq!(snapshot.lock_waits, 2);
        assert_eq!(snapshot.lock_wait_total, Duration::from_millis(5));
    }

    #[test]
    fn test_remaining_unknown_until_recorded() {
        let metrics = Metrics::new();
        assert_eq!(metrics.last_remaining(), None);

        metrics.record_remaining(0);
        assert_eq!(metrics.last_remaining(), Some(0));
    }

    #[test]
    fn test_request_headers_are_redacted() {
        use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer ghp_secret"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));

        let logged = redacted_headers(&headers);
        assert!(logged.contains(&("authorization".to_string(), "[REDACTED]".to_string())));
        assert!(logged.contains(&(
            "accept".to_string(),
            "application/vnd.github+json".to_string()
        )));
        assert!(!format!("{:?}", logged).contains("ghp_secret"));
        assert_eq!(redact_header("Proxy-Authorization", "Basic abc"), "[REDACTED]");
    }
}
