//! # GitHub Resilience
//!
//! A GitHub REST/GraphQL client layer built to survive a hostile host:
//! - Replay-safe retrying transport with exponential backoff and `Retry-After`
//! - Self-imposed token bucket plus the server-reported quota monitor
//! - Per-credential concurrency lock (Redis, or in process)
//! - Static GraphQL cost estimation for pre-flight charging
//! - Bounded resends of 403 responses that look like rate limiting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use github_resilience::{AuthMethod, Context, GitHubClient, GitHubConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GitHubConfig::builder()
//!         .auth(AuthMethod::pat("ghp_xxxxxxxxxxxx"))
//!         .build()?;
//!     let client = GitHubClient::new(config)?;
//!
//!     let ctx = Context::background().with_timeout(Duration::from_secs(30));
//!     let user: serde_json::Value = client.get(&ctx, "/user").await?;
//!     println!("{}", user["login"]);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;

// Authentication
pub mod auth;

// HTTP transport and client
pub mod client;
pub mod transport;

// Pagination handling
pub mod pagination;

// GraphQL wire types and cost estimation
pub mod graphql;

// Resilience patterns
pub mod cache;
pub mod ratelimit;
pub mod resilience;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::AuthMethod;
pub use client::{GitHubClient, GitHubClientBuilder, RestResponse};
pub use config::{GitHubConfig, GitHubConfigBuilder};
pub use context::Context;
pub use errors::{GitHubError, GitHubErrorKind, GitHubResult};
pub use graphql::{GraphQLError, GraphQLResponse};
pub use pagination::{Page, PaginationLinks};
pub use ratelimit::RateLimitState;
pub use resilience::{connect_throttle, ConcurrencyThrottle};
