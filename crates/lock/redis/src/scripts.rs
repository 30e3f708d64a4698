/// Reply code: the key was free and is now held by the caller.
pub const ACQUIRED: i64 = 1;
/// Reply code: the key is already held by the same issuer.
pub const REENTERED: i64 = 2;
/// Reply code: the key is held by another issuer.
pub const DENIED: i64 = 0;

/// Lua script acquiring a lock, or reentering it for its current issuer.
///
/// The stored value is `"<token>:<issuer>"`, where the token is unique to one
/// acquisition and never contains `:`.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = value to store (`"<token>:<issuer>"`)
/// ARGV\[2\] = issuer
/// ARGV\[3\] = TTL in milliseconds
///
/// Returns `{1, ttl, value}` when acquired, `{2, pttl, stored}` when the
/// issuer already holds the key (the expiry is left untouched), and
/// `{0, 0, ''}` otherwise.
pub const LOCK_ACQUIRE: &str = r"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[3])
if ok then
    return {1, tonumber(ARGV[3]), ARGV[1]}
end
local held = redis.call('GET', KEYS[1])
if held then
    local sep = string.find(held, ':', 1, true)
    if sep and string.sub(held, sep + 1) == ARGV[2] then
        return {2, redis.call('PTTL', KEYS[1]), held}
    end
end
return {0, 0, ''}
";

/// Lua script deleting a lock only if it still holds the given acquisition.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = stored value of the acquisition being released
///
/// Returns 1 if deleted, 0 if absent or held by another acquisition.
pub const LOCK_RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Value stored for one acquisition of a lock by `issuer`.
pub fn lock_value(token: &str, issuer: &str) -> String {
    format!("{token}:{issuer}")
}
