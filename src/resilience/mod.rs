//! Resilience patterns for GitHub API calls.
//!
//! - [`policy`]: the decision of whether and when to retry an attempt
//! - [`retry`]: a [`Transport`](crate::transport::Transport) that replays requests
//! - [`throttle`]: per-credential concurrency locking

pub mod policy;
pub mod retry;
pub mod throttle;

pub use policy::{retry_after, Attempt, RetryDecision, RetryPolicy};
pub use retry::RetryingTransport;
pub use throttle::{
    connect_throttle, lock_name, ConcurrencyThrottle, InProcessThrottle, LockHandle, NoopThrottle,
    ThrottlePermit,
};

#[cfg(feature = "redis")]
pub use throttle::RedisThrottle;
