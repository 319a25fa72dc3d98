//! Rate limiter over the shared store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};
use uuid::Uuid;

use super::rules::{Algorithm, RateLimiterConfig};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::Result;
use crate::store::{Script, ScriptArg, ScriptExecutor, StoreError};

/// Extra time a sliding window set outlives its period, so an idle limiter's
/// state still ages out of the store.
pub const SLIDING_WINDOW_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Result of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitDecision {
    /// Permitted; `used` permits (including this one) are now counted in the window.
    Granted { used: u64 },
    /// Capacity exhausted for the current window.
    Denied,
}

impl PermitDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermitDecision::Granted { .. })
    }
}

/// A rate limiter shared by every process using the store.
///
/// The limiter holds only its definition. Counts and timestamps live in the
/// store under the limiter's name, and each check runs as one atomic script.
/// Denials are immediate; nothing is queued.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    executor: Arc<dyn ScriptExecutor>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter. Fails if the definition is invalid.
    pub fn new(config: RateLimiterConfig, executor: Arc<dyn ScriptExecutor>) -> Result<Self> {
        Self::with_clock(config, executor, Arc::new(SystemClock))
    }

    /// Create a limiter that timestamps sliding window events with `clock`.
    pub fn with_clock(
        config: RateLimiterConfig,
        executor: Arc<dyn ScriptExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            clock,
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Ask for one permit.
    ///
    /// Returns `false` when the window is full or when the store cannot be
    /// reached. Failures are logged, never raised.
    pub async fn get_permission(&self) -> bool {
        match self.check().await {
            Ok(decision) => decision.is_granted(),
            Err(e) => {
                error!(
                    limiter = %self.config.name,
                    algorithm = %self.config.algorithm,
                    error = %e,
                    "Permission check failed, denying"
                );
                false
            }
        }
    }

    /// Ask for one permit, surfacing store failures.
    pub async fn check(&self) -> std::result::Result<PermitDecision, StoreError> {
        let (script, args) = match self.config.algorithm {
            Algorithm::FixedWindow => (Script::FixedWindowPermit, self.fixed_window_args()),
            Algorithm::SlidingWindow => (Script::SlidingWindowPermit, self.sliding_window_args()),
        };
        let keys = [self.config.name.clone()];

        trace!(
            limiter = %self.config.name,
            algorithm = %self.config.algorithm,
            "Checking permission"
        );

        let result = self.executor.execute(script, &keys, &args).await?;
        let decision = match result {
            Some(used) if used > 0 => PermitDecision::Granted { used: used as u64 },
            _ => PermitDecision::Denied,
        };

        if decision == PermitDecision::Denied {
            debug!(
                limiter = %self.config.name,
                capacity = self.config.capacity,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn fixed_window_args(&self) -> Vec<ScriptArg> {
        vec![
            self.config.capacity.into(),
            duration_millis(self.config.refresh_period).into(),
        ]
    }

    fn sliding_window_args(&self) -> Vec<ScriptArg> {
        let now = self.clock.now_millis();
        vec![
            self.config.capacity.into(),
            duration_millis(self.config.refresh_period).into(),
            now.into(),
            Uuid::new_v4().simple().to_string().into(),
            duration_millis(SLIDING_WINDOW_EXPIRY_MARGIN).into(),
        ]
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::GatekeeperError;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            Self {
                store: Arc::new(MemoryStore::with_clock(clock.clone())),
                clock,
            }
        }

        fn limiter(&self, name: &str, algorithm: Algorithm) -> RateLimiter {
            let config =
                RateLimiterConfig::new(name, 5, Duration::from_millis(5_000)).with_algorithm(algorithm);
            RateLimiter::with_clock(config, self.store.clone(), self.clock.clone()).unwrap()
        }

        fn sleep(&self, millis: u64) {
            self.clock.advance(Duration::from_millis(millis));
        }
    }

    async fn burst(limiter: &RateLimiter, n: usize) -> Vec<bool> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(limiter.get_permission().await);
        }
        results
    }

    fn count(results: &[bool]) -> usize {
        results.iter().filter(|r| **r).count()
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let store: Arc<dyn ScriptExecutor> = Arc::new(MemoryStore::new());
        let config = RateLimiterConfig::new("api", 0, Duration::from_secs(1));
        assert!(matches!(
            RateLimiter::new(config, store.clone()),
            Err(GatekeeperError::Config(_))
        ));

        let config = RateLimiterConfig::new("api", 5, Duration::MAX);
        assert!(matches!(
            RateLimiter::new(config, store),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fixed_window_denies_beyond_capacity() {
        let h = Harness::new();
        let limiter = h.limiter("fw", Algorithm::FixedWindow);

        for used in 1..=5 {
            assert_eq!(limiter.check().await.unwrap(), PermitDecision::Granted { used });
        }
        assert_eq!(limiter.check().await.unwrap(), PermitDecision::Denied);
        assert_eq!(limiter.check().await.unwrap(), PermitDecision::Denied);
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_burst() {
        let h = Harness::new();
        let limiter = h.limiter("fw", Algorithm::FixedWindow);

        assert!(limiter.get_permission().await);
        h.sleep(4_500);

        let results = burst(&limiter, 9).await;
        assert_eq!(results, [true, true, true, true, false, false, false, false, false]);

        // The window anchored at the first permit has expired
        h.sleep(1_000);
        let results = burst(&limiter, 10).await;
        assert_eq!(count(&results[..5]), 5);
        assert_eq!(count(&results[5..]), 0);
    }

    #[tokio::test]
    async fn test_sliding_window_has_no_boundary_burst() {
        let h = Harness::new();
        let limiter = h.limiter("sw", Algorithm::SlidingWindow);

        assert!(limiter.get_permission().await);
        h.sleep(4_500);

        let results = burst(&limiter, 9).await;
        assert_eq!(results, [true, true, true, true, false, false, false, false, false]);

        // Only the first event has left the trailing 5s window
        h.sleep(1_000);
        let results = burst(&limiter, 5).await;
        assert_eq!(results, [true, false, false, false, false]);

        // The four events at 4.5s leave once 5s have passed since them
        h.sleep(3_999);
        assert!(!limiter.get_permission().await);
        h.sleep(1);
        assert_eq!(count(&burst(&limiter, 5).await), 4);
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_capacity_in_any_trailing_period() {
        let h = Harness::new();
        let limiter = h.limiter("sw", Algorithm::SlidingWindow);
        let mut granted_at: Vec<i64> = Vec::new();

        // One attempt every 250ms for 30s
        for _ in 0..120 {
            if limiter.get_permission().await {
                granted_at.push(h.clock.now_millis());
            }
            h.sleep(250);
        }

        for (i, start) in granted_at.iter().enumerate() {
            let in_window = granted_at[i..].iter().take_while(|t| **t < start + 5_000).count();
            assert!(in_window <= 5, "{} permits within 5s of {}", in_window, start);
        }
        assert!(granted_at.len() >= 25);
    }

    #[tokio::test]
    async fn test_sliding_window_purges_on_denial() {
        let h = Harness::new();
        let limiter = h.limiter("sw", Algorithm::SlidingWindow);

        assert_eq!(count(&burst(&limiter, 5).await), 5);
        assert_eq!(h.store.event_count("sw"), 5);

        h.sleep(5_000);
        assert!(limiter.get_permission().await);
        assert_eq!(h.store.event_count("sw"), 1);
    }

    #[tokio::test]
    async fn test_same_millisecond_events_are_distinct() {
        let h = Harness::new();
        let a = h.limiter("sw", Algorithm::SlidingWindow);
        let b = h.limiter("sw", Algorithm::SlidingWindow);

        assert!(a.get_permission().await);
        assert!(b.get_permission().await);
        assert_eq!(h.store.event_count("sw"), 2);
    }

    #[tokio::test]
    async fn test_limiters_share_state_by_name() {
        let h = Harness::new();
        let a = h.limiter("shared", Algorithm::FixedWindow);
        let b = h.limiter("shared", Algorithm::FixedWindow);
        let other = h.limiter("other", Algorithm::FixedWindow);

        assert_eq!(count(&burst(&a, 3).await), 3);
        assert_eq!(count(&burst(&b, 3).await), 2);
        assert_eq!(count(&burst(&other, 3).await), 3);
    }

    #[tokio::test]
    async fn test_store_failure_denies() {
        let h = Harness::new();
        let fixed = h.limiter("fw", Algorithm::FixedWindow);
        let sliding = h.limiter("sw", Algorithm::SlidingWindow);
        h.store.set_unavailable(true);

        assert!(!fixed.get_permission().await);
        assert!(!sliding.get_permission().await);
        assert!(matches!(fixed.check().await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_respect_capacity() {
        let h = Harness::new();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = h.limiter("hot", Algorithm::FixedWindow);
                tokio::spawn(async move { limiter.get_permission().await })
            })
            .collect();

        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(granted, 5);
    }
}
