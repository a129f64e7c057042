//! Dual rate limiting: a self-imposed token bucket and the server-reported quota.

pub mod internal;
pub mod monitor;
pub mod registry;

pub use internal::InternalLimiter;
pub use monitor::{RateLimitMonitor, RateLimitState};
pub use registry::{MonitorKey, MonitorRegistry};
