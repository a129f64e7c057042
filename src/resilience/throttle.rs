//! Per-credential concurrency throttle.
//!
//! GitHub's abuse detection flags concurrent requests under one credential
//! even when each is within quota, so calls sharing a credential serialize on
//! a named lock. The lock is best effort: when it cannot be taken the call
//! goes ahead without it.

use crate::config::ConcurrencyConfig;
use crate::context::Context;
use crate::errors::GitHubResult;
use crate::observability::{Metrics, TracingHooks};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Prefix of every lock name.
pub const LOCK_PREFIX: &str = "github-concurrency:";

/// Lock name for a hashed credential.
///
/// Only the one-way hash ever reaches the lock backend.
pub fn lock_name(credential_hash: &str) -> String {
    format!("{}{}", LOCK_PREFIX, credential_hash)
}

enum Held {
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
    Remote { token: String },
}

/// Proof of holding a throttle lock. Exclusively owned until released.
pub struct LockHandle {
    name: String,
    id: Uuid,
    held: Held,
}

impl LockHandle {
    /// Handle for a lock held in a remote backend under `token`.
    pub fn remote(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            held: Held::Remote {
                token: token.into(),
            },
        }
    }

    fn local(name: String, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            name,
            id: Uuid::new_v4(),
            held: Held::Local(guard),
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique id of this acquisition.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token stored in a remote backend, if any.
    pub fn token(&self) -> Option<&str> {
        match &self.held {
            Held::Remote { token } => Some(token),
            Held::Local(_) => None,
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("remote", &matches!(self.held, Held::Remote { .. }))
            .finish()
    }
}

/// Named mutex keyed by credential hash.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConcurrencyThrottle: Send + Sync {
    /// Blocks until the lock for `credential_hash` is held or `ctx` ends.
    async fn acquire(&self, ctx: &Context, credential_hash: &str) -> GitHubResult<LockHandle>;

    /// Releases a held lock. Must not depend on the caller's context.
    async fn release(&self, handle: LockHandle) -> GitHubResult<()>;
}

/// Single-process fallback: one tokio mutex per lock name.
#[derive(Default)]
pub struct InProcessThrottle {
    mutexes: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl InProcessThrottle {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.mutexes.read().get(name) {
            return Arc::clone(mutex);
        }
        let mut mutexes = self.mutexes.write();
        Arc::clone(mutexes.entry(name.to_string()).or_default())
    }
}

#[async_trait]
impl ConcurrencyThrottle for InProcessThrottle {
    async fn acquire(&self, ctx: &Context, credential_hash: &str) -> GitHubResult<LockHandle> {
        let name = lock_name(credential_hash);
        let mutex = self.mutex_for(&name);
        let guard = ctx.run(mutex.lock_owned()).await?;
        Ok(LockHandle::local(name, guard))
    }

    async fn release(&self, handle: LockHandle) -> GitHubResult<()> {
        drop(handle);
        Ok(())
    }
}

/// Throttle that never blocks. Used when concurrency restriction is off.
#[derive(Debug, Default)]
pub struct NoopThrottle;

#[async_trait]
impl ConcurrencyThrottle for NoopThrottle {
    async fn acquire(&self, _ctx: &Context, credential_hash: &str) -> GitHubResult<LockHandle> {
        Ok(LockHandle::remote(lock_name(credential_hash), String::new()))
    }

    async fn release(&self, _handle: LockHandle) -> GitHubResult<()> {
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_lock::RedisThrottle;

#[cfg(feature = "redis")]
mod redis_lock {
    use super::{lock_name, ConcurrencyThrottle, LockHandle};
    use crate::config::ConcurrencyConfig;
    use crate::context::Context;
    use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use redis::Script;
    use std::time::Duration;
    use uuid::Uuid;

    /// Deletes the key only if it still holds our token.
    const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Upper bound on a release round trip.
    const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

    fn lock_error(e: redis::RedisError) -> GitHubError {
        GitHubError::new(GitHubErrorKind::LockUnavailable, format!("redis: {}", e)).with_cause(e)
    }

    /// Cross-process throttle backed by Redis `SET NX PX`.
    #[derive(Clone)]
    pub struct RedisThrottle {
        conn: MultiplexedConnection,
        expiry: Duration,
        retry_delay: Duration,
        max_tries: u32,
    }

    impl RedisThrottle {
        /// Connects to `url` and checks the server answers.
        pub async fn connect(url: &str, config: &ConcurrencyConfig) -> GitHubResult<Self> {
            let client = redis::Client::open(url).map_err(lock_error)?;
            let mut conn = client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(lock_error)?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(lock_error)?;

            Ok(Self {
                conn,
                expiry: config.lock_expiry,
                retry_delay: config.lock_retry_delay,
                max_tries: config.lock_max_tries.max(1),
            })
        }
    }

    #[async_trait]
    impl ConcurrencyThrottle for RedisThrottle {
        async fn acquire(&self, ctx: &Context, credential_hash: &str) -> GitHubResult<LockHandle> {
            let name = lock_name(credential_hash);
            let token = Uuid::new_v4().to_string();
            let expiry_ms = u64::try_from(self.expiry.as_millis()).unwrap_or(u64::MAX);
            let mut conn = self.conn.clone();

            for attempt in 0..self.max_tries {
                let set = ctx
                    .run(
                        redis::cmd("SET")
                            .arg(&name)
                            .arg(&token)
                            .arg("NX")
                            .arg("PX")
                            .arg(expiry_ms)
                            .query_async::<_, Option<String>>(&mut conn),
                    )
                    .await?
                    .map_err(lock_error)?;
                if set.is_some() {
                    return Ok(LockHandle::remote(name, token));
                }
                if attempt + 1 < self.max_tries {
                    ctx.sleep(self.retry_delay).await?;
                }
            }

            Err(GitHubError::new(
                GitHubErrorKind::LockUnavailable,
                format!("lock {} still held after {} tries", name, self.max_tries),
            ))
        }

        async fn release(&self, handle: LockHandle) -> GitHubResult<()> {
            let Some(token) = handle.token() else {
                return Ok(());
            };
            let mut conn = self.conn.clone();
            let script = Script::new(UNLOCK_SCRIPT);
            let mut invocation = script.key(handle.name());
            invocation.arg(token);

            let deleted = tokio::time::timeout(
                RELEASE_TIMEOUT,
                invocation.invoke_async::<_, i64>(&mut conn),
            )
            .await
            .map_err(|_| {
                GitHubError::new(
                    GitHubErrorKind::LockUnavailable,
                    format!("timed out releasing lock {}", handle.name()),
                )
            })?
            .map_err(lock_error)?;

            if deleted == 0 {
                tracing::debug!(lock = %handle.name(), "lock expired before release");
            }
            Ok(())
        }
    }
}

/// Picks the throttle backend.
///
/// Redis is used when a URL is given, the `redis` feature is enabled and the
/// server answers a ping. Otherwise locking happens in process.
pub async fn connect_throttle(
    redis_url: Option<&str>,
    config: &ConcurrencyConfig,
) -> Arc<dyn ConcurrencyThrottle> {
    if !config.restrict_concurrency {
        return Arc::new(NoopThrottle);
    }
    let Some(url) = redis_url else {
        return Arc::new(InProcessThrottle::new());
    };

    #[cfg(feature = "redis")]
    {
        match RedisThrottle::connect(url, config).await {
            Ok(throttle) => return Arc::new(throttle),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, using in-process concurrency lock")
            }
        }
    }
    #[cfg(not(feature = "redis"))]
    tracing::warn!(
        url = %url,
        "redis support not compiled in, using in-process concurrency lock"
    );

    Arc::new(InProcessThrottle::new())
}

/// Scoped throttle acquisition for one logical call.
///
/// Acquisition failures are logged and the call proceeds unlocked. The lock is
/// released by [`release`](Self::release), or in the background if the permit
/// is dropped first.
pub struct ThrottlePermit {
    throttle: Arc<dyn ConcurrencyThrottle>,
    handle: Option<LockHandle>,
}

impl ThrottlePermit {
    /// Acquires the lock for `credential_hash`, best effort.
    pub async fn acquire(
        throttle: Arc<dyn ConcurrencyThrottle>,
        ctx: &Context,
        credential_hash: &str,
        metrics: &Metrics,
    ) -> Self {
        let started = Instant::now();
        let handle = match throttle.acquire(ctx, credential_hash).await {
            Ok(handle) => {
                metrics.record_lock_wait(started.elapsed());
                Some(handle)
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                metrics.record_lock_failure();
                TracingHooks::on_lock_failure(&lock_name(credential_hash), &e.to_string());
                None
            }
        };
        Self { throttle, handle }
    }

    /// Returns true if the lock is held.
    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    /// Releases the lock, logging failures.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            let name = handle.name().to_string();
            if let Err(e) = self.throttle.release(handle).await {
                TracingHooks::on_unlock_failure(&name, &e.to_string());
            }
        }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let throttle = Arc::clone(&self.throttle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let name = handle.name().to_string();
                    if let Err(e) = throttle.release(handle).await {
                        TracingHooks::on_unlock_failure(&name, &e.to_string());
                    }
                });
            }
            // Local guards release on drop; remote entries expire.
            Err(_) => drop(handle),
        }
    }
}
