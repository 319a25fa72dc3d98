//! In-process store that runs the canonical scripts.
//!
//! Records live in a `DashMap`, and each script runs while holding the shard
//! lock for its single key. That gives the same per-key atomicity Redis gives
//! a Lua script. Expiry is measured against a [`Clock`] in milliseconds and
//! expired records are treated as absent, as in Redis.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{Script, ScriptArg, ScriptExecutor, StoreError};
use crate::clock::{Clock, SystemClock};

/// A value stored under a key.
#[derive(Debug, Clone)]
enum Value {
    /// Lock record: holder id -> hold count.
    Hash(HashMap<String, i64>),
    /// Fixed window counter.
    Counter(i64),
    /// Sliding window events as (timestamp, token).
    SortedSet(BTreeSet<(i64, String)>),
}

impl Value {
    fn as_hash_mut(&mut self) -> Result<&mut HashMap<String, i64>, StoreError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn as_counter(&self) -> Result<i64, StoreError> {
        match self {
            Value::Counter(c) => Ok(*c),
            _ => Err(wrong_type()),
        }
    }

    fn as_sorted_set_mut(&mut self) -> Result<&mut BTreeSet<(i64, String)>, StoreError> {
        match self {
            Value::SortedSet(s) => Ok(s),
            _ => Err(wrong_type()),
        }
    }
}

fn wrong_type() -> StoreError {
    StoreError::Script("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    /// Absolute expiry in clock milliseconds.
    expires_at: Option<i64>,
}

impl Record {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Remaining time to live in the PTTL convention (-1 when persistent).
    fn pttl(&self, now: i64) -> i64 {
        match self.expires_at {
            Some(at) => at.saturating_sub(now).max(0),
            None => -1,
        }
    }
}

/// Script calls between sweeps of expired records.
pub const SWEEP_INTERVAL: u64 = 1024;

/// An in-process [`ScriptExecutor`].
///
/// Useful for tests and for single-process deployments. Cloning shares the
/// underlying records. Expired records are dropped when their key is next
/// touched, and every [`SWEEP_INTERVAL`] calls the whole map is swept.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: Arc<DashMap<String, Option<Record>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create a store that measures expiry against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that measures expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether a live (unexpired) record exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.records
            .get(key)
            .map(|slot| slot.value().as_ref().is_some_and(|r| !r.is_expired(now)))
            .unwrap_or(false)
    }

    /// Remaining time to live for `key`, following PTTL: -2 when absent,
    /// -1 when the key has no expiry.
    pub fn pttl(&self, key: &str) -> i64 {
        let now = self.clock.now_millis();
        match self.records.get(key) {
            Some(slot) => match slot.value() {
                Some(record) if !record.is_expired(now) => record.pttl(now),
                _ => -2,
            },
            None => -2,
        }
    }

    /// Current hold count of `holder` on lock `key`, if any.
    pub fn hold_count(&self, key: &str, holder: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        let slot = self.records.get(key)?;
        match slot.value() {
            Some(record) if !record.is_expired(now) => match &record.value {
                Value::Hash(h) => h.get(holder).copied(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Number of sliding window events recorded for `key`.
    pub fn event_count(&self, key: &str) -> usize {
        let now = self.clock.now_millis();
        let Some(slot) = self.records.get(key) else {
            return 0;
        };
        match slot.value() {
            Some(record) if !record.is_expired(now) => match &record.value {
                Value::SortedSet(s) => s.len(),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Number of records held, including expired ones not yet swept.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records
            .retain(|_, slot| slot.as_ref().is_some_and(|r| !r.is_expired(now)));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "Purged expired records");
        }
        removed
    }

    /// Run `f` against the live slot for `key` while holding its shard lock.
    fn with_key<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<Record>, i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = self.clock.now_millis();
        let result = {
            let mut entry = self.records.entry(key.to_string()).or_insert(None);
            let slot = entry.value_mut();
            if slot.as_ref().is_some_and(|r| r.is_expired(now)) {
                trace!(key = %key, "Record expired");
                *slot = None;
            }
            f(slot, now)
        };
        self.records.remove_if(key, |_, slot| slot.is_none());
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn single_key(script: Script, keys: &[String]) -> Result<&str, StoreError> {
    match keys {
        [key] => Ok(key.as_str()),
        _ => Err(StoreError::Script(format!(
            "{} expects exactly one key, got {}",
            script,
            keys.len()
        ))),
    }
}

fn int_arg(script: Script, args: &[ScriptArg], index: usize) -> Result<i64, StoreError> {
    args.get(index)
        .and_then(ScriptArg::as_int)
        .ok_or_else(|| StoreError::Script(format!("{}: ARGV[{}] must be an integer", script, index + 1)))
}

fn str_arg(script: Script, args: &[ScriptArg], index: usize) -> Result<String, StoreError> {
    args.get(index)
        .map(|a| a.as_str().into_owned())
        .ok_or_else(|| StoreError::Script(format!("{}: ARGV[{}] is missing", script, index + 1)))
}

fn lock(slot: &mut Option<Record>, now: i64, lease: i64, holder: &str) -> Result<Option<i64>, StoreError> {
    let Some(record) = slot.as_mut() else {
        *slot = Some(Record {
            value: Value::Hash(HashMap::from([(holder.to_string(), 1)])),
            expires_at: Some(now.saturating_add(lease)),
        });
        return Ok(None);
    };

    let ttl = record.pttl(now);
    let hash = record.value.as_hash_mut()?;
    match hash.get_mut(holder) {
        Some(count) => {
            *count += 1;
            record.expires_at = Some(now.saturating_add(lease));
            Ok(None)
        }
        None => Ok(Some(ttl)),
    }
}

fn unlock(slot: &mut Option<Record>, holder: &str) -> Result<Option<i64>, StoreError> {
    let Some(record) = slot.as_mut() else {
        return Ok(Some(1));
    };

    let hash = record.value.as_hash_mut()?;
    let Some(count) = hash.get_mut(holder) else {
        return Ok(Some(0));
    };
    *count -= 1;
    if *count <= 0 {
        *slot = None;
    }
    Ok(Some(1))
}

fn fixed_window(
    slot: &mut Option<Record>,
    now: i64,
    capacity: i64,
    period: i64,
) -> Result<Option<i64>, StoreError> {
    let current = match slot.as_ref() {
        Some(record) => record.value.as_counter()?,
        None => 0,
    };
    if current >= capacity {
        return Ok(Some(0));
    }

    let record = slot.get_or_insert(Record {
        value: Value::Counter(0),
        expires_at: None,
    });
    record.value = Value::Counter(current + 1);
    if current == 0 {
        record.expires_at = Some(now.saturating_add(period));
    }
    Ok(Some(current + 1))
}

fn sliding_window(
    slot: &mut Option<Record>,
    store_now: i64,
    capacity: i64,
    period: i64,
    now: i64,
    token: String,
    margin: i64,
) -> Result<Option<i64>, StoreError> {
    let expired_before = now.saturating_sub(period);
    let count = match slot.as_mut() {
        Some(record) => {
            let events = record.value.as_sorted_set_mut()?;
            events.retain(|(at, _)| *at > expired_before);
            events.len() as i64
        }
        None => 0,
    };
    // Redis drops a sorted set once its last member is removed.
    if count == 0 {
        *slot = None;
    }
    if count >= capacity {
        return Ok(Some(0));
    }

    let record = slot.get_or_insert(Record {
        value: Value::SortedSet(BTreeSet::new()),
        expires_at: None,
    });
    record.value.as_sorted_set_mut()?.insert((now, token));
    record.expires_at = Some(store_now.saturating_add(period).saturating_add(margin));
    Ok(Some(count + 1))
}

#[async_trait]
impl ScriptExecutor for MemoryStore {
    async fn execute(
        &self,
        script: Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<Option<i64>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            debug!(script = %script, "Memory store marked unavailable");
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }

        let key = single_key(script, keys)?;
        trace!(script = %script, key = %key, "Executing script in memory");

        let result = self.run(script, key, args);
        if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_expired();
        }
        result
    }
}

impl MemoryStore {
    fn run(&self, script: Script, key: &str, args: &[ScriptArg]) -> Result<Option<i64>, StoreError> {
        match script {
            Script::Lock => {
                let lease = int_arg(script, args, 0)?;
                let holder = str_arg(script, args, 1)?;
                self.with_key(key, |slot, now| lock(slot, now, lease, &holder))
            }
            Script::Unlock => {
                let holder = str_arg(script, args, 0)?;
                self.with_key(key, |slot, _| unlock(slot, &holder))
            }
            Script::FixedWindowPermit => {
                let capacity = int_arg(script, args, 0)?;
                let period = int_arg(script, args, 1)?;
                self.with_key(key, |slot, now| fixed_window(slot, now, capacity, period))
            }
            Script::SlidingWindowPermit => {
                let capacity = int_arg(script, args, 0)?;
                let period = int_arg(script, args, 1)?;
                let now = int_arg(script, args, 2)?;
                let token = str_arg(script, args, 3)?;
                let margin = int_arg(script, args, 4)?;
                self.with_key(key, |slot, store_now| {
                    sliding_window(slot, store_now, capacity, period, now, token, margin)
                })
            }
        }
    }
}
