//! Lock holder identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use uuid::Uuid;

/// Generated once per process; never reused across restarts.
fn process_id() -> &'static str {
    static PROCESS_ID: OnceLock<String> = OnceLock::new();
    PROCESS_ID.get_or_init(|| Uuid::new_v4().simple().to_string())
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identifies one logical lock owner across every process sharing a store.
///
/// The id combines a random per-process component with a per-process
/// sequence number, so two owners never share an id even when processes
/// restart or reuse thread ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderId(String);

impl HolderId {
    /// Mint a new owner id.
    pub fn generate() -> Self {
        let seq = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}:{}", process_id(), seq))
    }

    /// Use a caller-chosen id, e.g. one persisted by a job runner.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
