//! Atomic script execution against the shared store.
//!
//! Locks and limiters keep no state of their own. Every decision is made by
//! one of four scripts that the store runs atomically against a single key,
//! so callers in different processes never race between reading and writing.
//!
//! A single authoritative store instance is assumed. There is no quorum
//! across replicas.

mod memory;
mod redis;
mod scripts;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisExecutor, DEFAULT_RESPONSE_TIMEOUT};

/// Errors that can occur while executing a script.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Script failed: {0}")]
    Script(String),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// The canonical scripts understood by every executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// Acquire or re-enter a reentrant lock.
    Lock,
    /// Release one level of a reentrant lock.
    Unlock,
    /// Fixed window permit check.
    FixedWindowPermit,
    /// Sliding window permit check.
    SlidingWindowPermit,
}

impl Script {
    pub const ALL: [Script; 4] = [
        Script::Lock,
        Script::Unlock,
        Script::FixedWindowPermit,
        Script::SlidingWindowPermit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Script::Lock => "lock",
            Script::Unlock => "unlock",
            Script::FixedWindowPermit => "fixed_window_permit",
            Script::SlidingWindowPermit => "sliding_window_permit",
        }
    }

    /// The Lua source run by Redis for this script.
    pub fn body(&self) -> &'static str {
        match self {
            Script::Lock => scripts::LOCK,
            Script::Unlock => scripts::UNLOCK,
            Script::FixedWindowPermit => scripts::FIXED_WINDOW_PERMIT,
            Script::SlidingWindowPermit => scripts::SLIDING_WINDOW_PERMIT,
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value argument (ARGV entry) passed to a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Int(i64),
    Str(String),
}

impl ScriptArg {
    /// Numeric view of the argument, following Lua's `tonumber`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptArg::Int(v) => Some(*v),
            ScriptArg::Str(s) => s.trim().parse().ok(),
        }
    }

    /// String view of the argument.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            ScriptArg::Int(v) => v.to_string().into(),
            ScriptArg::Str(s) => s.as_str().into(),
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(v: i64) -> Self {
        ScriptArg::Int(v)
    }
}

impl From<u64> for ScriptArg {
    fn from(v: u64) -> Self {
        ScriptArg::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<String> for ScriptArg {
    fn from(v: String) -> Self {
        ScriptArg::Str(v)
    }
}

impl From<&str> for ScriptArg {
    fn from(v: &str) -> Self {
        ScriptArg::Str(v.to_string())
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptArg::Int(v) => write!(f, "{}", v),
            ScriptArg::Str(s) => f.write_str(s),
        }
    }
}

/// Runs a canonical script atomically against the shared store.
///
/// Implementations must guarantee that a script executes without
/// interleaving from any other operation on the same keys. The result is
/// the script's single scalar reply: `None` for nil, `Some` for an integer.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        script: Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<Option<i64>, StoreError>;
}
