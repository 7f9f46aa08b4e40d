//! Lua scripts run atomically by the Redis lock store.
//!
//! Fair locks keep two structures per lock key: a list holding waiter tokens
//! in arrival order and a sorted set scoring each waiter by the server time
//! (ms) at which it stops counting as alive.

/// Delete a key only when it holds the given token.
/// KEYS[1] = lock key, ARGV[1] = token. Returns 1 when deleted.
pub const RELEASE_LOCK: &str = r#"
    if redis.call('get', KEYS[1]) == ARGV[1] then
        return redis.call('del', KEYS[1])
    end
    return 0
"#;

/// Take every lock key or none.
/// KEYS = lock keys, ARGV[1] = token, ARGV[2] = ttl (ms). Returns 1 on success.
pub const ACQUIRE_ALL: &str = r#"
    for i = 1, #KEYS do
        if redis.call('exists', KEYS[i]) == 1 then
            return 0
        end
    end
    for i = 1, #KEYS do
        redis.call('set', KEYS[i], ARGV[1], 'px', ARGV[2])
    end
    return 1
"#;

/// Take every lock key or none, honouring the waiter queues.
/// KEYS = n lock keys, n queue keys, n timeout keys.
/// ARGV[1] = token, ARGV[2] = ttl (ms), ARGV[3] = waiter window (ms).
/// Returns 1 on success; otherwise the caller is queued and 0 is returned.
pub const ACQUIRE_ALL_FAIR: &str = r#"
    local n = #KEYS / 3
    local token = ARGV[1]
    local time = redis.call('time')
    local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

    for i = 1, n do
        local queue, timeouts = KEYS[n + i], KEYS[2 * n + i]
        while true do
            local head = redis.call('lindex', queue, 0)
            if not head then
                break
            end
            local deadline = tonumber(redis.call('zscore', timeouts, head))
            if deadline and deadline >= now then
                break
            end
            redis.call('lpop', queue)
            redis.call('zrem', timeouts, head)
        end
    end

    local ready = true
    for i = 1, n do
        if redis.call('exists', KEYS[i]) == 1 then
            ready = false
            break
        end
        local head = redis.call('lindex', KEYS[n + i], 0)
        if head and head ~= token then
            ready = false
            break
        end
    end

    if ready then
        for i = 1, n do
            redis.call('set', KEYS[i], token, 'px', ARGV[2])
            redis.call('lrem', KEYS[n + i], 0, token)
            redis.call('zrem', KEYS[2 * n + i], token)
        end
        return 1
    end

    local window = tonumber(ARGV[3])
    for i = 1, n do
        local queue, timeouts = KEYS[n + i], KEYS[2 * n + i]
        if not redis.call('zscore', timeouts, token) then
            redis.call('rpush', queue, token)
        end
        redis.call('zadd', timeouts, now + window, token)
        redis.call('pexpire', queue, window * 2)
        redis.call('pexpire', timeouts, window * 2)
    end
    return 0
"#;

/// Delete every lock key still holding the token.
/// KEYS = lock keys, ARGV[1] = token. Returns the number deleted.
pub const RELEASE_ALL: &str = r#"
    local released = 0
    for i = 1, #KEYS do
        if redis.call('get', KEYS[i]) == ARGV[1] then
            redis.call('del', KEYS[i])
            released = released + 1
        end
    end
    return released
"#;

/// Reset the expiry of every lock key still holding the token.
/// KEYS = lock keys, ARGV[1] = token, ARGV[2] = ttl (ms).
/// Returns the number renewed.
pub const RENEW_ALL: &str = r#"
    local renewed = 0
    for i = 1, #KEYS do
        if redis.call('get', KEYS[i]) == ARGV[1] then
            redis.call('pexpire', KEYS[i], ARGV[2])
            renewed = renewed + 1
        end
    end
    return renewed
"#;

/// Withdraw a waiter from the queues.
/// KEYS = n queue keys, n timeout keys, ARGV[1] = token.
pub const LEAVE_QUEUE: &str = r#"
    local n = #KEYS / 2
    for i = 1, n do
        redis.call('lrem', KEYS[i], 0, ARGV[1])
        redis.call('zrem', KEYS[n + i], ARGV[1])
    end
    return 1
"#;

pub fn queue_key(key: &str) -> String {
    format!("keylock_queue:{{{}}}", key)
}

pub fn timeout_key(key: &str) -> String {
    format!("keylock_timeout:{{{}}}", key)
}
