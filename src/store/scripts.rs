//! Lua scripts backing the atomic store operations on Redis
//!
//! Each script mirrors a pure function in `resilience::state` or a mutex
//! section in the in-memory store. Keys passed to one invocation always share
//! a hash tag.

/// Write an entry and add it to its subject index.
///
/// KEYS[1] entry, KEYS[2] index; ARGV[1] value, ARGV[2] ttl in ms.
/// The index lives at least as long as its longest entry.
pub const SET_INDEXED: &str = r"
local ttl = tonumber(ARGV[2])
redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
redis.call('SADD', KEYS[2], KEYS[1])
if redis.call('PTTL', KEYS[2]) < ttl then
    redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
";

/// Delete every member of an index, then the index.
///
/// Members share the index hash tag, so they live on the same slot.
pub const DELETE_INDEXED: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
local deleted = 0
for _, key in ipairs(members) do
    deleted = deleted + redis.call('DEL', key)
end
redis.call('DEL', KEYS[1])
return deleted
";

pub const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

pub const COMPARE_AND_EXPIRE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Circuit breaker transition.
///
/// KEYS[1] state hash; ARGV: outcome, failure_threshold, recovery_ms, now_ms.
/// Returns {can_execute, state, event, failure_count}.
pub const BREAKER_TRANSITION: &str = r"
local outcome = ARGV[1]
local threshold = tonumber(ARGV[2])
local recovery = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local fields = redis.call('HMGET', KEYS[1], 'state', 'failures', 'opened_at')
local state = fields[1] or 'CLOSED'
local failures = tonumber(fields[2]) or 0
local opened_at = tonumber(fields[3]) or 0
local event = ''

if outcome == 'check' then
    if state == 'OPEN' and now - opened_at >= recovery then
        state = 'HALF_OPEN'
        event = 'open_to_half_open'
    end
elseif outcome == 'success' then
    if state == 'HALF_OPEN' then
        state = 'CLOSED'
        failures = 0
        event = 'half_open_to_closed'
    elseif state == 'CLOSED' then
        failures = 0
    end
elseif outcome == 'failure' then
    if state == 'CLOSED' then
        failures = failures + 1
        if failures >= threshold then
            state = 'OPEN'
            opened_at = now
            event = 'closed_to_open'
        end
    elseif state == 'HALF_OPEN' then
        state = 'OPEN'
        opened_at = now
        failures = failures + 1
        event = 'half_open_to_open'
    end
end

redis.call('HSET', KEYS[1], 'state', state, 'failures', failures, 'opened_at', opened_at)

local allowed = 1
if state == 'OPEN' then
    allowed = 0
end
return {allowed, state, event, failures}
";

/// Multi-dimension rate limit check.
///
/// ARGV[1] algorithm, ARGV[2] now_ms, ARGV[3] rule count, then
/// (limit, window_ms, burst) per rule. KEYS: the bucket hash per rule for
/// token buckets; the current and previous window counters per rule for the
/// window algorithms. Consumes from every rule only when all of them allow
/// the call.
/// Returns {allowed, limited_by (1-based, 0 = none), remaining, retry_after_ms}.
pub const RATE_LIMIT: &str = r"
local algorithm = ARGV[1]
local now = tonumber(ARGV[2])
local count = tonumber(ARGV[3])
local plans = {}
local denied = 0
local remaining = -1
local retry = 0

for i = 1, count do
    local base = 4 + (i - 1) * 3
    local limit = tonumber(ARGV[base])
    local window = tonumber(ARGV[base + 1])
    local burst = tonumber(ARGV[base + 2])
    local allowed = false
    local left = 0
    local wait = 0

    if algorithm == 'token_bucket' then
        local key = KEYS[i]
        local state = redis.call('HMGET', key, 'tokens', 'ts')
        local tokens = tonumber(state[1])
        local ts = tonumber(state[2])
        if tokens == nil or ts == nil then
            tokens = burst
            ts = now
        end
        if now > ts then
            tokens = math.min(burst, tokens + (now - ts) * limit / window)
            ts = now
        end
        if tokens >= 1 then
            allowed = true
            left = math.floor(tokens - 1)
        else
            wait = math.ceil((1 - tokens) * window / limit)
        end
        plans[i] = {key, tokens, ts, math.ceil(burst * window / limit) + window}
    else
        local current_key = KEYS[2 * i - 1]
        local current_window = math.floor(now / window)
        local used = tonumber(redis.call('GET', current_key) or '0')
        if algorithm == 'sliding_window' then
            local previous = tonumber(redis.call('GET', KEYS[2 * i]) or '0')
            local elapsed = now - current_window * window
            used = previous * (window - elapsed) / window + used
        end
        if used + 1 <= limit then
            allowed = true
            left = math.floor(limit - used - 1)
        else
            wait = (current_window + 1) * window - now
        end
        plans[i] = {current_key, window * 2}
    end

    if not allowed then
        if denied == 0 then
            denied = i
        end
        if wait > retry then
            retry = wait
        end
    end
    if remaining < 0 or left < remaining then
        remaining = left
    end
end

if denied == 0 then
    for i = 1, count do
        local plan = plans[i]
        if algorithm == 'token_bucket' then
            redis.call('HSET', plan[1], 'tokens', plan[2] - 1, 'ts', plan[3])
            redis.call('PEXPIRE', plan[1], plan[4])
        else
            redis.call('INCR', plan[1])
            redis.call('PEXPIRE', plan[1], plan[2])
        end
    end
    return {1, 0, remaining, 0}
end

return {0, denied, 0, retry}
";

/// KEYS[1] bulkhead totals hash, KEYS[2] lease set scored by expiry;
/// ARGV[1] max_concurrency, ARGV[2] lease_ms, ARGV[3] now_ms, ARGV[4] permit.
/// Returns {admitted, active, total}.
pub const BULKHEAD_ACQUIRE: &str = r"
local max = tonumber(ARGV[1])
local lease = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
local active = redis.call('ZCARD', KEYS[2])
local total = tonumber(redis.call('HGET', KEYS[1], 'total') or '0')
if active < max then
    redis.call('ZADD', KEYS[2], now + lease, ARGV[4])
    redis.call('PEXPIRE', KEYS[2], lease)
    total = redis.call('HINCRBY', KEYS[1], 'total', 1)
    return {1, active + 1, total}
end
return {0, active, total}
";

/// KEYS[1] lease set; ARGV[1] permit, ARGV[2] now_ms. Returns active leases.
pub const BULKHEAD_RELEASE: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
return redis.call('ZCARD', KEYS[1])
";
