//! Self-imposed token bucket, keyed per credential.

use crate::config::RateLimitConfig;
use crate::context::Context;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Token bucket bounding the local request rate for each credential.
///
/// Sized below GitHub's published ceiling so other processes sharing the
/// credential still have room.
pub struct InternalLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    bucket_size: NonZeroU32,
}

impl InternalLimiter {
    /// Creates a limiter holding `bucket_size` tokens refilled at `refill_rate` per second.
    pub fn new(bucket_size: u32, refill_rate: f64) -> GitHubResult<Self> {
        let bucket_size = NonZeroU32::new(bucket_size).ok_or_else(|| {
            GitHubError::configuration("internal_bucket_size must be at least 1")
        })?;
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(GitHubError::configuration(
                "internal_refill_rate must be a positive number",
            ));
        }
        let period = Duration::try_from_secs_f64(1.0 / refill_rate).map_err(|_| {
            GitHubError::configuration(format!(
                "internal_refill_rate {} is too low to schedule",
                refill_rate
            ))
        })?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| GitHubError::configuration("internal_refill_rate is too high"))?
            .allow_burst(bucket_size);

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            bucket_size,
        })
    }

    /// Creates a limiter from configuration.
    pub fn from_config(config: &RateLimitConfig) -> GitHubResult<Self> {
        Self::new(config.internal_bucket_size, config.internal_refill_rate)
    }

    /// Blocks until `cost` tokens are available for `key`.
    ///
    /// A cost of zero is charged as one token.
    pub async fn wait(&self, ctx: &Context, key: &str, cost: u32) -> GitHubResult<()> {
        let n = NonZeroU32::new(cost).unwrap_or(NonZeroU32::MIN);
        if n > self.bucket_size {
            return Err(GitHubError::new(
                GitHubErrorKind::InternalRateLimitExceeded,
                format!(
                    "request cost {} exceeds internal bucket size {}",
                    n, self.bucket_size
                ),
            ));
        }

        let key = key.to_string();
        ctx.run(self.limiter.until_key_n_ready(&key, n))
            .await?
            .map_err(|e| {
                GitHubError::new(
                    GitHubErrorKind::InternalRateLimitExceeded,
                    format!("internal rate limiter: {}", e),
                )
            })?;
        Ok(())
    }

    /// Capacity of each bucket.
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size.get()
    }
}
