//! Entry point handing out locks and limiters bound to one store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::GatekeeperConfig;
use crate::error::{GatekeeperError, Result};
use crate::lock::{LockOptions, ReentrantLock};
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::store::{RedisExecutor, ScriptExecutor};

/// Hands out [`ReentrantLock`] and [`RateLimiter`] handles that share one
/// script executor.
///
/// Handles are cheap views over store state; create them freely and drop
/// them when done. The only state kept here is the set of named limiter
/// definitions.
pub struct Gatekeeper {
    executor: Arc<dyn ScriptExecutor>,
    clock: Arc<dyn Clock>,
    lock_options: LockOptions,
    /// Named limiter definitions.
    limiters: RwLock<HashMap<String, RateLimiterConfig>>,
}

impl Gatekeeper {
    /// Create a gatekeeper over an executor.
    pub fn new(executor: Arc<dyn ScriptExecutor>, lock_options: LockOptions) -> Self {
        Self {
            executor,
            clock: Arc::new(SystemClock),
            lock_options,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Use `clock` to timestamp sliding window events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connect to the configured Redis instance and register the configured
    /// limiters.
    pub async fn connect(config: &GatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let executor = RedisExecutor::connect(&config.store.url)
            .await?
            .with_response_timeout(config.store.response_timeout());
        let gatekeeper = Self::new(Arc::new(executor), config.lock.options());
        gatekeeper.set_rate_limiters(config.rate_limiters.clone())?;

        info!(
            limiters = config.rate_limiters.len(),
            "Gatekeeper ready"
        );
        Ok(gatekeeper)
    }

    /// The executor shared by every handle.
    pub fn executor(&self) -> &Arc<dyn ScriptExecutor> {
        &self.executor
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    /// A lock handle for `name` with a fresh holder id.
    pub fn reentrant_lock(&self, name: impl Into<String>) -> Result<ReentrantLock> {
        ReentrantLock::with_options(name, self.executor.clone(), self.lock_options)
    }

    /// A limiter for an ad hoc definition.
    pub fn rate_limiter(&self, config: RateLimiterConfig) -> Result<RateLimiter> {
        RateLimiter::with_clock(config, self.executor.clone(), self.clock.clone())
    }

    /// A limiter for a registered definition.
    pub fn named_rate_limiter(&self, name: &str) -> Result<RateLimiter> {
        let config = self
            .limiters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatekeeperError::Config(format!("unknown rate limiter '{}'", name)))?;
        self.rate_limiter(config)
    }

    /// Register or replace one definition.
    pub fn register_rate_limiter(&self, config: RateLimiterConfig) -> Result<()> {
        config.validate()?;
        debug!(limiter = %config.name, capacity = config.capacity, algorithm = %config.algorithm, "Registering rate limiter");
        self.limiters.write().insert(config.name.clone(), config);
        Ok(())
    }

    /// Replace every definition. Nothing changes if any definition is invalid.
    pub fn set_rate_limiters(&self, configs: Vec<RateLimiterConfig>) -> Result<()> {
        for config in &configs {
            config.validate()?;
        }
        let map: HashMap<_, _> = configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        *self.limiters.write() = map;
        Ok(())
    }

    /// Names of the registered definitions, sorted.
    pub fn rate_limiter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("lock_options", &self.lock_options)
            .field("limiters", &self.rate_limiter_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::Algorithm;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn gatekeeper() -> (Gatekeeper, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let gatekeeper = Gatekeeper::new(store.clone(), LockOptions::default()).with_clock(clock.clone());
        (gatekeeper, store, clock)
    }

    #[tokio::test]
    async fn test_locks_from_same_gatekeeper_contend() {
        let (gk, _, _) = gatekeeper();
        let a = gk.reentrant_lock("job").unwrap();
        let b = gk.reentrant_lock("job").unwrap();

        assert!(a.try_lock().await);
        assert!(!b.try_lock().await);
        a.unlock().await.unwrap();
        assert!(b.try_lock().await);
    }

    #[test]
    fn test_lock_uses_configured_options() {
        let store = Arc::new(MemoryStore::new());
        let options = LockOptions {
            lease: Duration::from_secs(5),
            retry_interval: Duration::from_millis(10),
        };
        let gk = Gatekeeper::new(store, options);

        assert_eq!(*gk.reentrant_lock("job").unwrap().options(), options);
        assert!(gk.reentrant_lock("").is_err());
    }

    #[tokio::test]
    async fn test_named_rate_limiter() {
        let (gk, _, clock) = gatekeeper();
        gk.register_rate_limiter(
            RateLimiterConfig::new("api", 2, Duration::from_secs(1)).with_algorithm(Algorithm::SlidingWindow),
        )
        .unwrap();

        let limiter = gk.named_rate_limiter("api").unwrap();
        assert_eq!(limiter.config().algorithm, Algorithm::SlidingWindow);
        assert!(limiter.get_permission().await);
        assert!(limiter.get_permission().await);
        assert!(!limiter.get_permission().await);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.get_permission().await);
    }

    #[test]
    fn test_unknown_limiter_is_config_error() {
        let (gk, _, _) = gatekeeper();
        assert!(matches!(
            gk.named_rate_limiter("missing"),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_set_rate_limiters_is_all_or_nothing() {
        let (gk, _, _) = gatekeeper();
        gk.register_rate_limiter(RateLimiterConfig::new("old", 1, Duration::from_secs(1)))
            .unwrap();

        let result = gk.set_rate_limiters(vec![
            RateLimiterConfig::new("a", 1, Duration::from_secs(1)),
            RateLimiterConfig::new("b", 0, Duration::from_secs(1)),
        ]);
        assert!(result.is_err());
        assert_eq!(gk.rate_limiter_names(), vec!["old".to_string()]);

        gk.set_rate_limiters(vec![
            RateLimiterConfig::new("b", 1, Duration::from_secs(1)),
            RateLimiterConfig::new("a", 1, Duration::from_secs(1)),
        ])
        .unwrap();
        assert_eq!(gk.rate_limiter_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_invalid_ad_hoc_limiter_rejected() {
        let (gk, _, _) = gatekeeper();
        assert!(gk
            .rate_limiter(RateLimiterConfig::new("", 1, Duration::from_secs(1)))
            .is_err());
    }
}
