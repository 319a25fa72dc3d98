//! Reentrant lock over the shared store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use super::holder::HolderId;
use crate::clock::{duration_millis, MAX_EXPIRY};
use crate::error::{GatekeeperError, Result};
use crate::store::{Script, ScriptArg, ScriptExecutor};

/// Default lease applied on every successful acquire.
pub const DEFAULT_LEASE: Duration = Duration::from_millis(30_000);
/// Default delay between acquisition attempts in [`ReentrantLock::lock`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for a [`ReentrantLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Time to live of the lock record, reset on every acquire and re-entry.
    /// If the holder dies this is how long the lock stays unavailable.
    pub lease: Duration,
    /// Sleep between polls while waiting for the lock.
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock is now held (or re-entered) by this handle's holder.
    Acquired,
    /// Another holder owns the lock. `remaining` is its lease, if any.
    Contended { remaining: Option<Duration> },
    /// The store could not be reached; counts as not acquired.
    Failed,
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired)
    }
}

/// A reentrant mutual-exclusion lock shared by every process using the store.
///
/// The handle holds no lock state. The record in the store maps the current
/// holder to its hold count, and the store runs each acquire and release
/// atomically. Each handle gets its own [`HolderId`]; clones share it, so a
/// clone re-enters rather than contends. Waiters are not queued, and which
/// one wins when the lock frees up is undefined.
#[derive(Clone)]
pub struct ReentrantLock {
    name: String,
    holder: HolderId,
    executor: Arc<dyn ScriptExecutor>,
    options: LockOptions,
}

impl ReentrantLock {
    /// Create a lock handle with default options and a fresh holder id.
    pub fn new(name: impl Into<String>, executor: Arc<dyn ScriptExecutor>) -> Result<Self> {
        Self::with_options(name, executor, LockOptions::default())
    }

    /// Create a lock handle with explicit options and a fresh holder id.
    pub fn with_options(
        name: impl Into<String>,
        executor: Arc<dyn ScriptExecutor>,
        options: LockOptions,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(GatekeeperError::Config("lock name must not be empty".into()));
        }
        if options.lease < Duration::from_millis(1) {
            return Err(GatekeeperError::Config(format!(
                "lock '{}': lease must be at least 1ms",
                name
            )));
        }
        if options.lease > MAX_EXPIRY {
            return Err(GatekeeperError::Config(format!(
                "lock '{}': lease must not exceed {}ms",
                name,
                duration_millis(MAX_EXPIRY)
            )));
        }

        Ok(Self {
            name,
            holder: HolderId::generate(),
            executor,
            options,
        })
    }

    /// Bind this handle to an existing owner.
    pub fn with_holder(mut self, holder: HolderId) -> Self {
        self.holder = holder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Make one acquisition attempt.
    pub async fn attempt(&self) -> LockAttempt {
        let keys = [self.name.clone()];
        let args: [ScriptArg; 2] = [
            duration_millis(self.options.lease).into(),
            self.holder.as_str().into(),
        ];

        trace!(lock = %self.name, holder = %self.holder, "Attempting to acquire lock");

        match self.executor.execute(Script::Lock, &keys, &args).await {
            Ok(None) => {
                debug!(lock = %self.name, holder = %self.holder, "Lock acquired");
                LockAttempt::Acquired
            }
            Ok(Some(ttl)) => {
                trace!(lock = %self.name, remaining_ms = ttl, "Lock held by another holder");
                LockAttempt::Contended {
                    remaining: u64::try_from(ttl).ok().map(Duration::from_millis),
                }
            }
            Err(e) => {
                error!(lock = %self.name, holder = %self.holder, error = %e, "Lock acquisition failed");
                LockAttempt::Failed
            }
        }
    }

    /// Try to acquire the lock once, without waiting.
    pub async fn try_lock(&self) -> bool {
        self.attempt().await.is_acquired()
    }

    /// Wait until the lock is acquired.
    ///
    /// Polls every `retry_interval` with no upper bound. Dropping the future
    /// abandons the wait; use [`lock_with_cancel`](Self::lock_with_cancel) or
    /// [`lock_timeout`](Self::lock_timeout) to learn that it was abandoned.
    pub async fn lock(&self) {
        while !self.try_lock().await {
            tokio::time::sleep(self.options.retry_interval).await;
        }
    }

    /// Wait until the lock is acquired or `cancel` resolves.
    ///
    /// The signal is checked before every attempt and raced against every
    /// retry sleep. Returns [`GatekeeperError::Cancelled`] if it fires first.
    /// An attempt already sent to the store always runs to completion, so a
    /// late signal never leaves an acquired lock behind unreported.
    pub async fn lock_with_cancel<F>(&self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.wait_until(cancel).await.map_err(|()| self.cancelled())
    }

    /// Wait up to `timeout` for the lock. Returns `false` if it timed out.
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<bool> {
        self.lock_timeout_with_cancel(timeout, std::future::pending()).await
    }

    /// Wait up to `timeout` for the lock, or until `cancel` resolves.
    ///
    /// Returns `Ok(false)` on timeout and [`GatekeeperError::Cancelled`] when
    /// the signal fires first.
    pub async fn lock_timeout_with_cancel<F>(&self, timeout: Duration, cancel: F) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        let stop = async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => Stop::Elapsed,
                _ = cancel => Stop::Cancelled,
            }
        };

        match self.wait_until(stop).await {
            Ok(()) => Ok(true),
            Err(Stop::Elapsed) => {
                debug!(lock = %self.name, holder = %self.holder, timeout_ms = duration_millis(timeout), "Lock wait timed out");
                Ok(false)
            }
            Err(Stop::Cancelled) => Err(self.cancelled()),
        }
    }

    /// Poll until acquired, or until `stop` resolves with its output.
    async fn wait_until<F, T>(&self, stop: F) -> std::result::Result<(), T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(stop);

        loop {
            if let Some(reason) = stop.as_mut().now_or_never() {
                return Err(reason);
            }
            if self.try_lock().await {
                return Ok(());
            }

            tokio::select! {
                reason = stop.as_mut() => return Err(reason),
                _ = tokio::time::sleep(self.options.retry_interval) => {}
            }
        }
    }

    /// Release one level of the lock.
    ///
    /// Releasing a lock that no longer exists succeeds. Releasing a lock
    /// owned by another holder, including one whose lease expired and was
    /// taken over, fails with [`GatekeeperError::NotHeld`]. Store failures
    /// are returned to the caller.
    pub async fn unlock(&self) -> Result<()> {
        let keys = [self.name.clone()];
        let args: [ScriptArg; 1] = [self.holder.as_str().into()];

        let result = self
            .executor
            .execute(Script::Unlock, &keys, &args)
            .await
            .map_err(|e| {
                error!(lock = %self.name, holder = %self.holder, error = %e, "Lock release failed");
                GatekeeperError::from(e)
            })?;

        match result {
            Some(0) => {
                warn!(lock = %self.name, holder = %self.holder, "Unlock by non-holder");
                Err(GatekeeperError::NotHeld {
                    lock: self.name.clone(),
                    holder: self.holder.to_string(),
                })
            }
            _ => {
                debug!(lock = %self.name, holder = %self.holder, "Lock released");
                Ok(())
            }
        }
    }

    fn cancelled(&self) -> GatekeeperError {
        warn!(lock = %self.name, holder = %self.holder, "Lock wait cancelled");
        GatekeeperError::Cancelled {
            lock: self.name.clone(),
        }
    }
}

/// Why a bounded wait stopped.
enum Stop {
    Elapsed,
    Cancelled,
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
