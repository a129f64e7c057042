//! Configuration types for the GitHub client.

use crate::auth::AuthMethod;
use crate::errors::{GitHubError, GitHubErrorKind};
use std::time::Duration;

/// Default GitHub API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Default GitHub API version (date-based).
pub const DEFAULT_API_VERSION: &str = "2022-11-28";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "github-resilience/0.1.0";

/// Default lifetime of cached enterprise version lookups.
pub const DEFAULT_VERSION_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Transport-level retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_attempts: u32,
    /// Lower bound for the backoff delay.
    pub base_delay: Duration,
    /// Upper bound for the backoff delay.
    pub max_delay: Duration,
    /// Longest `Retry-After` worth waiting for. Anything longer suppresses the retry.
    pub max_retry_after: Duration,
    /// Enable retries.
    pub enabled: bool,
}

impl RetryConfig {
    /// Retry cap after applying `enabled`.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts
        } else {
            0
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            max_retry_after: Duration::from_secs(3),
            enabled: true,
        }
    }
}

/// Rate limit configuration for both the internal and the external limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Block callers when the server-reported quota is exhausted.
    pub wait_for_rate_limit: bool,
    /// How many times a 403 is resent after a successful rate-limit wait.
    pub max_rate_limit_retries: u32,
    /// Internal token bucket capacity.
    pub internal_bucket_size: u32,
    /// Internal token bucket refill rate in tokens per second.
    pub internal_refill_rate: f64,
    /// Prefix of the rate-limit headers, e.g. `X-` for `X-RateLimit-Remaining`.
    pub header_prefix: String,
    /// Rate-limit resource bucket tracked by this client.
    pub resource: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            wait_for_rate_limit: true,
            max_rate_limit_retries: 2,
            // GitHub allows 5000/h; stay below that.
            internal_bucket_size: 500,
            internal_refill_rate: 1.1,
            header_prefix: "X-".to_string(),
            resource: "rest".to_string(),
        }
    }
}

/// Per-credential concurrency throttle configuration.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Serialize requests per credential.
    pub restrict_concurrency: bool,
    /// Expiry of a distributed lock entry.
    pub lock_expiry: Duration,
    /// Pause between distributed lock attempts.
    pub lock_retry_delay: Duration,
    /// Distributed lock attempts before giving up.
    pub lock_max_tries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            restrict_concurrency: true,
            lock_expiry: Duration::from_secs(30),
            lock_retry_delay: Duration::from_millis(100),
            lock_max_tries: 32,
        }
    }
}

/// GitHub client configuration.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// API base URL.
    pub base_url: String,
    /// API version header.
    pub api_version: String,
    /// Authentication method.
    pub auth: Option<AuthMethod>,
    /// Request timeout.
    pub timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Rate limit configuration.
    pub rate_limit: RateLimitConfig,
    /// Concurrency throttle configuration.
    pub concurrency: ConcurrencyConfig,
    /// Lifetime of cached enterprise version lookups.
    pub version_cache_ttl: Duration,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            auth: None,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            version_cache_ttl: DEFAULT_VERSION_CACHE_TTL,
        }
    }
}

impl GitHubConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> GitHubConfigBuilder {
        GitHubConfigBuilder::new()
    }

    /// Checks the settings the client cannot work around.
    pub fn validate(&self) -> Result<(), GitHubError> {
        let base = url::Url::parse(&self.base_url).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::InvalidBaseUrl,
                format!("invalid base URL {:?}: {}", self.base_url, e),
            )
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(GitHubError::new(
                GitHubErrorKind::InvalidBaseUrl,
                format!("base URL scheme {:?} is not http(s)", base.scheme()),
            ));
        }

        if self.user_agent.trim().is_empty() {
            return Err(GitHubError::configuration("user agent must not be empty"));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(GitHubError::configuration(
                "retry base_delay must not exceed max_delay",
            ));
        }

        if self.rate_limit.internal_bucket_size == 0 {
            return Err(GitHubError::configuration(
                "internal_bucket_size must be at least 1",
            ));
        }

        let refill = self.rate_limit.internal_refill_rate;
        if !refill.is_finite() || refill <= 0.0 {
            return Err(GitHubError::configuration(
                "internal_refill_rate must be a positive number",
            ));
        }
        if Duration::try_from_secs_f64(1.0 / refill).is_err() {
            return Err(GitHubError::configuration(
                "internal_refill_rate is too low to schedule",
            ));
        }

        Ok(())
    }
}

/// Builder for [`GitHubConfig`], starting from the defaults.
#[derive(Debug, Default)]
pub struct GitHubConfigBuilder {
    config: GitHubConfig,
}

impl GitHubConfigBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// API base URL, e.g. `https://ghe.example.com/api/v3`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Value of the `X-GitHub-Api-Version` header.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = version.into();
        self
    }

    /// Credential used for every request.
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.config.auth = Some(auth);
        self
    }

    /// Whole-request timeout of the base transport.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Connect timeout of the base transport.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// User agent sent with every request.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    /// Transport retry settings.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Disables transport retries.
    pub fn no_retry(mut self) -> Self {
        self.config.retry.enabled = false;
        self
    }

    /// Rate limiter settings.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Concurrency throttle settings.
    pub fn concurrency(mut self, config: ConcurrencyConfig) -> Self {
        self.config.concurrency = config;
        self
    }

    /// Lifetime of the enterprise version cache.
    pub fn version_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.version_cache_ttl = ttl;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<GitHubConfig, GitHubError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
