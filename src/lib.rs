//! Gatekeeper - Distributed Locking and Rate Limiting
//!
//! This crate coordinates independent processes through a shared Redis
//! instance. It provides a reentrant mutual-exclusion lock and a rate limiter
//! with fixed-window and sliding-window algorithms. All state lives in the
//! store and every decision is made by an atomic Lua script, so client
//! handles are stateless and safe to drop or recreate at any time.

pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod lock;
pub mod ratelimit;
pub mod store;

pub use crate::error::{GatekeeperError, Result};
pub use crate::gatekeeper::Gatekeeper;
pub use crate::lock::{HolderId, LockAttempt, LockOptions, ReentrantLock};
pub use crate::ratelimit::{Algorithm, PermitDecision, RateLimiter, RateLimiterConfig};
pub use crate::store::{MemoryStore, RedisExecutor, Script, ScriptArg, ScriptExecutor, StoreError};
