//! Named Lua scripts for the atomic compound operations the engine needs.
//! Grounded on `riptide-cache`'s `RedisCoordination::ACQUIRE_LEADERSHIP_SCRIPT`
//! / `RELEASE_LEADERSHIP_SCRIPT` pattern: a single `GET` + conditional
//! `SET`/`DEL`, evaluated atomically so no two callers can race between the
//! check and the write.

/// `KEYS[1]` = leader key, `ARGV[1]` = node id, `ARGV[2]` = ttl seconds.
/// Returns 1 if `node_id` now holds (or still holds and renewed) the lease,
/// 0 if another node holds it.
pub const COMPARE_AND_EXTEND: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == false or current == ARGV[1] then
    redis.call("SETEX", KEYS[1], tonumber(ARGV[2]), ARGV[1])
    return 1
else
    return 0
end
"#;

/// `KEYS[1]` = leader key, `ARGV[1]` = node id. Returns 1 if deleted, 0 if
/// the caller was not the current holder.
pub const COMPARE_AND_DELETE: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
else
    return 0
end
"#;

/// `KEYS[1]` = `key:{kid}` JSON blob, `KEYS[2]` = `group:{gid}:active` set.
/// `ARGV[1]` = key id (as stored in the active set), `ARGV[2]` = threshold,
/// `ARGV[3]` = error reason.
///
/// The key record is stored as a JSON-over-KV blob (mirroring
/// `riptide-cache`'s convention), so the atomic compound update decodes it,
/// bumps its counters, and re-encodes it in one Lua invocation — Redis
/// guarantees no other command interleaves with a running script. Once the
/// consecutive-failure count reaches `threshold` (0 disables blacklisting)
/// the record flips to `invalid` and is removed from the active set.
/// Returns 1 if the key was blacklisted by this call, 0 if not, -1 if the
/// key record did not exist.
pub const RECORD_FAILURE_TRANSITION: &str = r#"
local raw = redis.call("GET", KEYS[1])
if raw == false then
    return -1
end
local rec = cjson.decode(raw)
rec.request_count = (rec.request_count or 0) + 1
rec.failure_count = (rec.failure_count or 0) + 1
rec.consecutive_failures = (rec.consecutive_failures or 0) + 1
rec.last_error = ARGV[3]

local threshold = tonumber(ARGV[2])
local blacklisted = 0
if threshold > 0 and rec.consecutive_failures >= threshold then
    rec.status = "invalid"
    redis.call("SREM", KEYS[2], ARGV[1])
    blacklisted = 1
end
redis.call("SET", KEYS[1], cjson.encode(rec))
return blacklisted
"#;
