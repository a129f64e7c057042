//! Process-wide lookup of rate limit monitors.

use super::monitor::RateLimitMonitor;
use crate::clock::{Clock, SystemClock};
use crate::observability::Metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies one server-side quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey {
    /// API base URL.
    pub base_url: String,
    /// One-way hash of the credential.
    pub credential_hash: String,
    /// Rate-limit resource, e.g. `rest`, `graphql`, `search`.
    pub resource: String,
}

impl MonitorKey {
    /// Creates a key.
    pub fn new(
        base_url: impl Into<String>,
        credential_hash: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            credential_hash: credential_hash.into(),
            resource: resource.into(),
        }
    }
}

/// Hands out one shared [`RateLimitMonitor`] per [`MonitorKey`].
pub struct MonitorRegistry {
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    monitors: RwLock<HashMap<MonitorKey, Arc<RateLimitMonitor>>>,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MonitorRegistry {
    /// Creates an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            metrics: None,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Attaches `metrics` to every monitor created from now on.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the monitor for `key`, creating it on first use.
    pub fn monitor(&self, key: &MonitorKey, header_prefix: &str) -> Arc<RateLimitMonitor> {
        if let Some(monitor) = self.monitors.read().get(key) {
            return Arc::clone(monitor);
        }

        let mut monitors = self.monitors.write();
        let monitor = monitors.entry(key.clone()).or_insert_with(|| {
            let mut monitor =
                RateLimitMonitor::new(key.resource.clone(), header_prefix, self.clock.clone());
            if let Some(metrics) = &self.metrics {
                monitor = monitor.with_metrics(Arc::clone(metrics));
            }
            Arc::new(monitor)
        });
        Arc::clone(monitor)
    }

    /// Number of monitors created.
    pub fn len(&self) -> usize {
        self.monitors.read().len()
    }

    /// Returns true if no monitor was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_monitor() {
        let registry = MonitorRegistry::default();
        let key = MonitorKey::new("https://api.github.com", "abc", "rest");

        let a = registry.monitor(&key, "X-");
        let b = registry.monitor(&key, "X-");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keys_are_isolated() {
        let registry = MonitorRegistry::default();
        let rest = registry.monitor(&MonitorKey::new("https://api.github.com", "abc", "rest"), "X-");
        let graphql =
            registry.monitor(&MonitorKey::new("https://api.github.com", "abc", "graphql"), "X-");
        let other =
            registry.monitor(&MonitorKey::new("https://api.github.com", "def", "rest"), "X-");

        assert!(!Arc::ptr_eq(&rest, &graphql));
        assert!(!Arc::ptr_eq(&rest, &other));
        assert_eq!(graphql.resource(), "graphql");
    }
}
