//! Retry predicate and backoff for the transport layer.

use crate::config::RetryConfig;
use crate::errors::{GitHubError, GitHubErrorKind};
use crate::transport::{HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// One try of a request.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    /// Zero-based try number within one logical call.
    pub index: u32,
    /// The request as sent.
    pub request: &'a HttpRequest,
    /// Response, when one arrived.
    pub response: Option<&'a HttpResponse>,
    /// Error, when the exchange failed.
    pub error: Option<&'a GitHubError>,
}

/// Outcome of consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Send again.
    pub retry: bool,
    /// How long to wait first.
    pub delay: Duration,
}

impl RetryDecision {
    /// A decision to stop.
    pub const STOP: Self = Self {
        retry: false,
        delay: Duration::ZERO,
    };
}

/// Transport retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_attempts: u32,
    /// Lower bound for backoff.
    pub base_delay: Duration,
    /// Upper bound for backoff.
    pub max_delay: Duration,
    /// Longest `Retry-After` honored.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.effective_max_attempts(),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_retry_after: config.max_retry_after,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Combines the predicate and the delay.
    pub fn decide(&self, attempt: &Attempt<'_>) -> RetryDecision {
        if !self.should_retry(attempt) {
            return RetryDecision::STOP;
        }
        RetryDecision {
            retry: true,
            delay: self.delay(attempt),
        }
    }

    /// Whether the attempt is worth repeating.
    pub fn should_retry(&self, attempt: &Attempt<'_>) -> bool {
        if attempt.index >= self.max_attempts {
            return false;
        }

        if let Some(error) = attempt.error {
            return match error.kind() {
                GitHubErrorKind::Cancelled | GitHubErrorKind::DeadlineExceeded => false,
                GitHubErrorKind::DnsResolutionFailed => attempt.index < 2,
                GitHubErrorKind::TooManyRedirects
                | GitHubErrorKind::UnsupportedScheme
                | GitHubErrorKind::TlsError => false,
                kind if kind.is_network() => true,
                // Anything else produced below the HTTP layer is not a transient fault.
                _ => false,
            };
        }

        let Some(response) = attempt.response else {
            // No response and no error: treat as status 0.
            return true;
        };

        let status = response.status.as_u16();
        let retryable_status = status == 429 || (status >= 500 && status != 501);
        if !retryable_status {
            return false;
        }

        match retry_after(&response.headers, Utc::now()) {
            Some(wait) => wait <= self.max_retry_after,
            None => true,
        }
    }

    /// Wait before the next attempt.
    ///
    /// `Retry-After` wins when present, capped at `max_retry_after`. Otherwise
    /// full jitter over `base * 2^index`, clamped to `[base_delay, max_delay]`.
    pub fn delay(&self, attempt: &Attempt<'_>) -> Duration {
        if let Some(wait) = attempt
            .response
            .and_then(|r| retry_after(&r.headers, Utc::now()))
        {
            return wait.min(self.max_retry_after);
        }
        self.backoff(attempt.index)
    }

    fn backoff(&self, index: u32) -> Duration {
        let ceiling = 2u32
            .checked_pow(index)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        let sampled =
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64()));
        sampled.max(self.base_delay).min(self.max_delay)
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP date relative to `now`.
///
/// Dates in the past yield zero.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderValue;
    use reqwest::{Method, StatusCode};
    use test_case::test_case;
    use url::Url;

    fn request() -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse("https://api.github.com/user").unwrap())
    }

    fn response(status: u16, retry_after: Option<&str>) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        }
        HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            url: Url::parse("https://api.github.com/user").unwrap(),
            body: Bytes::new(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            max_retry_after: Duration::from_secs(3),
        }
    }

    #[test_case(500, true ; "internal error")]
    #[test_case(502, true ; "bad gateway")]
    #[test_case(503, true ; "unavailable")]
    #[test_case(501, false ; "not implemented")]
    #[test_case(429, true ; "too many requests")]
    #[test_case(200, false ; "ok")]
    #[test_case(304, false ; "not modified")]
    #[test_case(403, false ; "forbidden")]
    #[test_case(404, false ; "not found")]
    fn test_status_predicate(status: u16, expected: bool) {
        let req = request();
        let resp = response(status, None);
        let attempt = Attempt {
            index: 0,
            request: &req,
            response: Some(&resp),
            error: None,
        };
        assert_eq!(policy().should_retry(&attempt), expected);
    }

    #[test_case(GitHubErrorKind::ConnectionFailed, 0, true ; "connection failure")]
    #[test_case(GitHubErrorKind::Timeout, 3, true ; "timeout")]
    #[test_case(GitHubErrorKind::DnsResolutionFailed, 1, true ; "dns second attempt")]
    #[test_case(GitHubErrorKind::DnsResolutionFailed, 2, false ; "dns third attempt")]
    #[test_case(GitHubErrorKind::TooManyRedirects, 0, false ; "redirects")]
    #[test_case(GitHubErrorKind::UnsupportedScheme, 0, false ; "scheme")]
    #[test_case(GitHubErrorKind::TlsError, 0, false ; "tls authority")]
    #[test_case(GitHubErrorKind::Cancelled, 0, false ; "cancelled")]
    #[test_case(GitHubErrorKind::DeadlineExceeded, 0, false ; "deadline")]
    fn test_error_predicate(kind: GitHubErrorKind, index: u32, expected: bool) {
        let req = request();
        let err = GitHubError::new(kind, "boom");
        let attempt = Attempt {
            index,
            request: &req,
            response: None,
            error: Some(&err),
        };
        assert_eq!(policy().should_retry(&attempt), expected);
    }

    #[test]
    fn test_cap_stops_retries() {
        let req = request();
        let resp = response(503, None);
        let attempt = Attempt {
            index: 5,
            request: &req,
            response: Some(&resp),
            error: None,
        };
        assert_eq!(policy().decide(&attempt), RetryDecision::STOP);
    }

    #[test]
    fn test_backoff_bounds_and_jitter() {
        let policy = policy();
        let req = request();
        let mut above_base = false;

        for index in 0..5 {
            for _ in 0..200 {
                let attempt = Attempt {
                    index,
                    request: &req,
                    response: None,
                    error: None,
                };
                let delay = policy.delay(&attempt);
                assert!(delay >= policy.base_delay, "{:?} below base", delay);
                assert!(delay <= policy.max_delay, "{:?} above max", delay);
                above_base |= delay > policy.base_delay;
            }
        }

        assert!(above_base, "jitter never exceeded the base delay");
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let req = request();
        let attempt = Attempt {
            index: 40,
            request: &req,
            response: None,
            error: None,
        };
        assert!(policy().delay(&attempt) <= Duration::from_secs(3));
    }

    #[test]
    fn test_retry_after_wins_over_jitter() {
        let req = request();
        let resp = response(429, Some("1"));
        let attempt = Attempt {
            index: 0,
            request: &req,
            response: Some(&resp),
            error: None,
        };

        let decision = policy().decide(&attempt);
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_long_retry_after_is_capped_and_suppressed() {
        let req = request();
        let resp = response(503, Some("20"));
        let attempt = Attempt {
            index: 0,
            request: &req,
            response: Some(&resp),
            error: None,
        };

        assert_eq!(policy().delay(&attempt), Duration::from_secs(3));
        assert!(!policy().should_retry(&attempt));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:02 GMT"),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(2)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:27:00 GMT"),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_disabled_config_never_retries() {
        let config = RetryConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from(&config).max_attempts, 0);
    }
}
