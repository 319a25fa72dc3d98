//! Reentrant distributed lock.

mod holder;
mod reentrant;

pub use holder::HolderId;
pub use reentrant::{LockAttempt, LockOptions, ReentrantLock, DEFAULT_LEASE, DEFAULT_RETRY_INTERVAL};
