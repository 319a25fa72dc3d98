//! Redis-backed script executor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, trace, warn};

use super::{Script, ScriptArg, ScriptExecutor, StoreError};

/// The four scripts, hashed once so calls go out as EVALSHA.
struct ScriptCache {
    lock: redis::Script,
    unlock: redis::Script,
    fixed_window: redis::Script,
    sliding_window: redis::Script,
}

impl ScriptCache {
    fn new() -> Self {
        Self {
            lock: redis::Script::new(Script::Lock.body()),
            unlock: redis::Script::new(Script::Unlock.body()),
            fixed_window: redis::Script::new(Script::FixedWindowPermit.body()),
            sliding_window: redis::Script::new(Script::SlidingWindowPermit.body()),
        }
    }

    fn get(&self, script: Script) -> &redis::Script {
        match script {
            Script::Lock => &self.lock,
            Script::Unlock => &self.unlock,
            Script::FixedWindowPermit => &self.fixed_window,
            Script::SlidingWindowPermit => &self.sliding_window,
        }
    }
}

/// How long a script call may wait for its reply by default.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Executes scripts on a single Redis instance.
///
/// `redis::Script` sends EVALSHA and falls back to EVAL when the server's
/// script cache does not have the body yet. The connection is multiplexed,
/// so cloning the executor's connection per call is cheap. A call that gets
/// no reply within the response timeout fails with
/// [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct RedisExecutor {
    conn: MultiplexedConnection,
    scripts: Arc<ScriptCache>,
    response_timeout: Duration,
}

impl RedisExecutor {
    /// Wrap an existing connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            scripts: Arc::new(ScriptCache::new()),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Open a multiplexed connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(url = %url, "Connected to Redis");

        Ok(Self::new(conn))
    }
}

#[async_trait]
impl ScriptExecutor for RedisExecutor {
    async fn execute(
        &self,
        script: Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<Option<i64>, StoreError> {
        trace!(script = %script, keys = ?keys, "Executing script on Redis");

        let mut invocation = self.scripts.get(script).prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            match arg {
                ScriptArg::Int(v) => invocation.arg(*v),
                ScriptArg::Str(s) => invocation.arg(s.as_str()),
            };
        }

        let mut conn = self.conn.clone();
        bounded(script, self.response_timeout, invocation.invoke_async(&mut conn)).await
    }
}

/// Await a Redis reply for at most `timeout`.
async fn bounded<F>(script: Script, timeout: Duration, reply: F) -> Result<Option<i64>, StoreError>
where
    F: Future<Output = redis::RedisResult<Option<i64>>>,
{
    match tokio::time::timeout(timeout, reply).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(script = %script, timeout_ms = timeout.as_millis() as u64, "Redis reply timed out");
            Err(StoreError::Unavailable(format!(
                "no reply to {} within {}ms",
                script,
                timeout.as_millis()
            )))
        }
    }
}

impl std::fmt::Debug for RedisExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisExecutor")
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}
