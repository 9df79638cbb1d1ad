//! Lua script sources for the store's `EVAL` primitive. Each script is
//! the single round trip that makes its operation atomic; the in-memory
//! test store interprets these by identity (see `memory.rs`), while the
//! Redis-backed store ships the literal source to the server.

/// numkeys=2: KEYS[1] = `wal:writer:lock`, KEYS[2] = `wal:writer:fence`.
/// ARGV[1] = instance id.
/// Returns `{acquired: 0|1, fence_token}`.
pub const WAL_LOCK_ACQUIRE: &str = r#"
local acquired = 0
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
  acquired = 1
end
local fence = redis.call('INCR', KEYS[2])
return {acquired, fence}
"#;

/// numkeys=1: KEYS[1] = `wal:writer:lock`. ARGV[1] = instance id.
/// Deletes the lock only if it is still held by this instance.
pub const WAL_LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// numkeys=1: KEYS[1] = `billing:lock:{entry_id}`. ARGV[1] = correlation_id, ARGV[2] = ttl_secs.
/// `SET key correlation_id NX EX ttl`. Returns 1 if acquired, 0 otherwise.
pub const BILLING_LOCK_ACQUIRE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
  return 1
end
return 0
"#;

/// numkeys=1: KEYS[1] = `billing:lock:{entry_id}`. ARGV[1] = correlation_id.
/// Deletes the lock only if it is still held by this correlation id.
pub const BILLING_LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// numkeys=1: KEYS[1] = `credits:{account}:balance`. ARGV = [from_field, to_field, amount].
/// Atomically checks `from_field >= amount` and moves it to `to_field` in one round trip.
/// Returns 1 on success, 0 if insufficient.
pub const CREDIT_MOVE: &str = r#"
local have = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local amount = tonumber(ARGV[3])
if have < amount then
  return 0
end
redis.call('HINCRBY', KEYS[1], ARGV[1], -amount)
redis.call('HINCRBY', KEYS[1], ARGV[2], amount)
return 1
"#;

/// numkeys=1: KEYS[1] = `cn:wallet:{wallet}:daily`. ARGV = [amount, cap, ex_secs].
/// Increments the day's issued total and rejects (restoring the prior
/// value) if it would exceed the cap. Returns 1 on success, 0 on
/// `CAP_EXCEEDED`.
pub const CREDIT_NOTE_CAP_CHECK: &str = r#"
local amount = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
local total = redis.call('INCRBYFLOAT', KEYS[1], amount)
if tonumber(total) > cap then
  redis.call('INCRBYFLOAT', KEYS[1], -amount)
  return 0
end
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;
