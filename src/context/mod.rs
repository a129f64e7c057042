//! Per-call cancellation and deadline.
//!
//! Every operation that can block (limiter waits, lock acquisition, retry
//! backoff, rate-limit waits, the HTTP exchange) takes a [`Context`] and
//! returns [`GitHubErrorKind::Cancelled`](crate::errors::GitHubErrorKind::Cancelled)
//! or [`GitHubErrorKind::DeadlineExceeded`](crate::errors::GitHubErrorKind::DeadlineExceeded)
//! once it ends.

use crate::errors::{GitHubError, GitHubResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal plus an optional deadline, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never ends unless cancelled through [`Context::cancel`].
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that also ends after `timeout`.
    ///
    /// The earlier of the parent's deadline and the new one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derives a context that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The error describing why the context ended, if it has.
    pub fn err(&self) -> Option<GitHubError> {
        if self.token.is_cancelled() {
            return Some(GitHubError::cancelled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(GitHubError::deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolves when the context ends, yielding the reason.
    pub async fn done(&self) -> GitHubError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => GitHubError::cancelled(),
                    _ = tokio::time::sleep_until(deadline) => GitHubError::deadline_exceeded(),
                }
            }
            None => {
                self.token.cancelled().await;
                GitHubError::cancelled()
            }
        }
    }

    /// Runs `fut` until it completes or the context ends.
    pub async fn run<F, T>(&self, fut: F) -> GitHubResult<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration`, returning early with the context error.
    pub async fn sleep(&self, duration: Duration) -> GitHubResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitHubErrorKind;

    #[tokio::test]
    async fn test_background_is_not_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.run(async { 7 }).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();

        assert_eq!(*child.err().unwrap().kind(), GitHubErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Context::background();
        let child = parent.with_cancel();
        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();

        assert_eq!(*err.kind(), GitHubErrorKind::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_on_cancel() {
        let ctx = Context::background();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_parent_deadline_wins() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
