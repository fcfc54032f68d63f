//! Sync engine configuration.
//!
//! Every value has a default suited to a browser-like client talking to a
//! managed backend. Use the builder for custom values, or
//! [`SyncConfig::from_env`] to read overrides from `AGORA_*` variables.

use std::time::Duration;

use agora_shared::CacheKey;

use crate::cache::QueryCategory;

/// Timeouts, limiter and breaker settings shared by all engine components.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Budget for guarded operations that do not pick a category.
    /// Default: 5 seconds
    pub default_timeout: Duration,

    /// Budget for identity and session lookups.
    /// Default: 3 seconds
    pub identity_timeout: Duration,

    /// Budget for general backend calls, including per-key cache refetches.
    /// Default: 8 seconds
    pub backend_timeout: Duration,

    /// Budget for setting up one change-stream subscription.
    /// Default: 5 seconds
    pub subscribe_timeout: Duration,

    /// Minimum interval between two transport recreations.
    /// Default: 5 seconds
    pub recreate_min_interval: Duration,

    /// Consecutive failed recovery batches before the breaker opens.
    /// Default: 3
    pub breaker_threshold: u32,

    /// How long the breaker stays open before allowing a probe batch.
    /// Default: 30 seconds
    pub breaker_cooldown: Duration,

    /// Window in which a light trigger is absorbed by a previous recovery.
    /// Default: 1 second
    pub trigger_debounce: Duration,

    /// Upper bound of the random delay before an automatic recovery.
    /// Default: 0 (disabled)
    pub recovery_jitter: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            identity_timeout: Duration::from_secs(3),
            backend_timeout: Duration::from_secs(8),
            subscribe_timeout: Duration::from_secs(5),
            recreate_min_interval: Duration::from_secs(5),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            trigger_debounce: Duration::from_secs(1),
            recovery_jitter: Duration::ZERO,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Per-key fetch budgets derived from this configuration.
    pub fn key_timeouts(&self) -> KeyTimeouts {
        KeyTimeouts {
            identity: self.identity_timeout,
            backend: self.backend_timeout,
        }
    }

    /// Short budgets for tests and local development.
    pub fn fast() -> Self {
        Self {
            default_timeout: Duration::from_millis(500),
            identity_timeout: Duration::from_millis(300),
            backend_timeout: Duration::from_millis(800),
            subscribe_timeout: Duration::from_millis(500),
            recreate_min_interval: Duration::from_millis(500),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(2),
            trigger_debounce: Duration::from_millis(100),
            recovery_jitter: Duration::ZERO,
        }
    }

    /// Generous budgets for high-latency mobile networks.
    pub fn relaxed() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            identity_timeout: Duration::from_secs(6),
            backend_timeout: Duration::from_secs(20),
            subscribe_timeout: Duration::from_secs(15),
            recreate_min_interval: Duration::from_secs(15),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            trigger_debounce: Duration::from_secs(3),
            recovery_jitter: Duration::from_secs(2),
        }
    }

    /// Read overrides from the environment on top of the defaults.
    ///
    /// Environment variables (milliseconds unless noted):
    /// - `AGORA_GUARD_TIMEOUT_MS`
    /// - `AGORA_IDENTITY_TIMEOUT_MS`
    /// - `AGORA_BACKEND_TIMEOUT_MS`
    /// - `AGORA_SUBSCRIBE_TIMEOUT_MS`
    /// - `AGORA_RECREATE_INTERVAL_MS`
    /// - `AGORA_BREAKER_THRESHOLD` (count)
    /// - `AGORA_BREAKER_COOLDOWN_MS`
    /// - `AGORA_TRIGGER_DEBOUNCE_MS`
    /// - `AGORA_RECOVERY_JITTER_MS`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |name: &str| -> Option<Duration> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    crate::log_warn!("config"; "ignoring {}={:?}: not a number of milliseconds", name, raw);
                    None
                }
            }
        };

        if let Some(d) = millis("AGORA_GUARD_TIMEOUT_MS") {
            config.default_timeout = d;
        }
        if let Some(d) = millis("AGORA_IDENTITY_TIMEOUT_MS") {
            config.identity_timeout = d;
        }
        if let Some(d) = millis("AGORA_BACKEND_TIMEOUT_MS") {
            config.backend_timeout = d;
        }
        if let Some(d) = millis("AGORA_SUBSCRIBE_TIMEOUT_MS") {
            config.subscribe_timeout = d;
        }
        if let Some(d) = millis("AGORA_RECREATE_INTERVAL_MS") {
            config.recreate_min_interval = d;
        }
        if let Some(d) = millis("AGORA_BREAKER_COOLDOWN_MS") {
            config.breaker_cooldown = d;
        }
        if let Some(d) = millis("AGORA_TRIGGER_DEBOUNCE_MS") {
            config.trigger_debounce = d;
        }
        if let Some(d) = millis("AGORA_RECOVERY_JITTER_MS") {
            config.recovery_jitter = d;
        }
        if let Some(raw) = lookup("AGORA_BREAKER_THRESHOLD") {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.breaker_threshold = n,
                _ => {
                    crate::log_warn!("config"; "ignoring AGORA_BREAKER_THRESHOLD={:?}", raw);
                }
            }
        }

        config
    }
}

/// Fetch budget for one cache key: identity lookups get the identity
/// budget, everything else the backend budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTimeouts {
    pub identity: Duration,
    pub backend: Duration,
}

impl KeyTimeouts {
    /// The same budget for every key.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            identity: timeout,
            backend: timeout,
        }
    }

    pub fn for_key(&self, key: &CacheKey) -> Duration {
        match QueryCategory::of(key) {
            QueryCategory::Identity => self.identity,
            _ => self.backend,
        }
    }
}

impl Default for KeyTimeouts {
    fn default() -> Self {
        SyncConfig::default().key_timeouts()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn identity_timeout(mut self, timeout: Duration) -> Self {
        self.config.identity_timeout = timeout;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = timeout;
        self
    }

    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.config.subscribe_timeout = timeout;
        self
    }

    pub fn recreate_min_interval(mut self, interval: Duration) -> Self {
        self.config.recreate_min_interval = interval;
        self
    }

    /// Set the breaker threshold. Zero is clamped to one.
    pub fn breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.breaker_threshold = threshold.max(1);
        self
    }

    pub fn breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.breaker_cooldown = cooldown;
        self
    }

    pub fn trigger_debounce(mut self, window: Duration) -> Self {
        self.config.trigger_debounce = window;
        self
    }

    pub fn recovery_jitter(mut self, jitter: Duration) -> Self {
        self.config.recovery_jitter = jitter;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_recommended_budgets() {
        let config = SyncConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.identity_timeout, Duration::from_secs(3));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(config.recreate_min_interval, Duration::from_secs(5));
        assert!(config.recovery_jitter.is_zero());
    }

    #[test]
    fn test_builder_clamps_threshold() {
        let config = SyncConfig::builder()
            .breaker_threshold(0)
            .backend_timeout(Duration::from_secs(10))
            .build();
        assert_eq!(config.breaker_threshold, 1);
        assert_eq!(config.backend_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_identity_keys_get_the_identity_budget() {
        use crate::cache::keys;
        use agora_shared::EntityDomain;

        let timeouts = SyncConfig::fast().key_timeouts();
        assert_eq!(timeouts.for_key(&keys::session()), Duration::from_millis(300));
        assert_eq!(timeouts.for_key(&keys::current_user()), Duration::from_millis(300));
        assert_eq!(
            timeouts.for_key(&keys::detail(EntityDomain::Post, "p1")),
            Duration::from_millis(800)
        );
        assert_eq!(timeouts.for_key(&keys::feed()), Duration::from_millis(800));

        let uniform = KeyTimeouts::uniform(Duration::from_secs(2));
        assert_eq!(uniform.for_key(&keys::session()), Duration::from_secs(2));
    }

    #[test]
    fn test_lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("AGORA_RECREATE_INTERVAL_MS", "2500"),
            ("AGORA_BREAKER_THRESHOLD", "7"),
            ("AGORA_BACKEND_TIMEOUT_MS", "soon"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.recreate_min_interval, Duration::from_millis(2500));
        assert_eq!(config.breaker_threshold, 7);
        assert_eq!(config.backend_timeout, Duration::from_secs(8));
    }
}
