//! Lua bodies of the four canonical scripts.
//!
//! Every script touches a single key, so the store can serialize them per key.
//!
//! [`MemoryStore`](super::MemoryStore) implements the same contracts in Rust
//! and is the reference the lock and limiter tests run against. Any change
//! here must be mirrored there. The bodies themselves only run against a live
//! server, in the `#[ignore]` tests of `store::redis` (`REDIS_URL=... cargo
//! test -- --ignored`).

/// Acquire or re-enter a lock.
///
/// KEYS[1] = lock name
/// ARGV[1] = lease in milliseconds
/// ARGV[2] = holder id
///
/// Returns: nil when acquired, the remaining lease (PTTL) otherwise
pub const LOCK: &str = r#"
if (redis.call('exists', KEYS[1]) == 0) then
    redis.call('hset', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return nil;
end;
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return nil;
end;
return redis.call('pttl', KEYS[1]);
"#;

/// Release one level of a lock.
///
/// KEYS[1] = lock name
/// ARGV[1] = holder id
///
/// Returns: 1 when released (or already absent), 0 when held by another holder
pub const UNLOCK: &str = r#"
if (redis.call('exists', KEYS[1]) == 0) then
    return 1;
end;
if (redis.call('hexists', KEYS[1], ARGV[1]) == 1) then
    local count = redis.call('hincrby', KEYS[1], ARGV[1], -1);
    if (count <= 0) then
        redis.call('del', KEYS[1]);
    end;
    return 1;
end;
return 0;
"#;

/// Fixed window permit check.
///
/// KEYS[1] = limiter name
/// ARGV[1] = capacity
/// ARGV[2] = refresh period in milliseconds
///
/// Returns: the new count when permitted, 0 when denied
pub const FIXED_WINDOW_PERMIT: &str = r#"
local key = KEYS[1];
local capacity = tonumber(ARGV[1]);
local period = tonumber(ARGV[2]);
local current = tonumber(redis.call('get', key) or '0');
if (current >= capacity) then
    return 0;
end;
redis.call('incrby', key, 1);
if (current == 0) then
    redis.call('pexpire', key, period);
end;
return current + 1;
"#;

/// Sliding window permit check.
///
/// KEYS[1] = limiter name
/// ARGV[1] = capacity
/// ARGV[2] = refresh period in milliseconds
/// ARGV[3] = current time in milliseconds
/// ARGV[4] = unique token for this call
/// ARGV[5] = expiry margin in milliseconds
///
/// Returns: the new count when permitted, 0 when denied
pub const SLIDING_WINDOW_PERMIT: &str = r#"
local key = KEYS[1];
local capacity = tonumber(ARGV[1]);
local period = tonumber(ARGV[2]);
local now = tonumber(ARGV[3]);
local margin = tonumber(ARGV[5]);
redis.call('zremrangebyscore', key, '-inf', now - period);
local count = redis.call('zcard', key);
if (count >= capacity) then
    return 0;
end;
redis.call('zadd', key, now, ARGV[4]);
redis.call('pexpire', key, period + margin);
return count + 1;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    /// Highest `ARGV[n]` index a body reads.
    fn argv_count(body: &str) -> usize {
        body.match_indices("ARGV[")
            .filter_map(|(at, _)| {
                let rest = &body[at + 5..];
                rest[..rest.find(']')?].parse::<usize>().ok()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_bodies_read_the_arguments_the_memory_store_reads() {
        assert_eq!(argv_count(LOCK), 2);
        assert_eq!(argv_count(UNLOCK), 1);
        assert_eq!(argv_count(FIXED_WINDOW_PERMIT), 2);
        assert_eq!(argv_count(SLIDING_WINDOW_PERMIT), 5);
    }

    #[test]
    fn test_bodies_touch_only_their_single_key() {
        for body in [LOCK, UNLOCK, FIXED_WINDOW_PERMIT, SLIDING_WINDOW_PERMIT] {
            assert!(body.contains("KEYS[1]"));
            assert!(!body.contains("KEYS[2]"));
        }
    }
}
