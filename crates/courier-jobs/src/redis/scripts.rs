//! Lua scripts for atomic job transitions.

use redis::Script;

/// Score shared by every script that inserts into a waiting set.
const WAITING_SCORE_FN: &str = r"
local function waiting_score(priority, seq)
  return tonumber(priority) * 4294967296 + (tonumber(seq) % 4294967296)
end
";

/// KEYS: job, waiting, delayed, dead, seq
/// ARGV: id, now, available_at, priority, mode, dead cap, job prefix, field/value pairs...
const ENQUEUE: &str = r"
local seq = redis.call('INCR', KEYS[5])
local fields = {}
for i = 8, #ARGV do
  fields[#fields + 1] = ARGV[i]
end
redis.call('HSET', KEYS[1], unpack(fields))
redis.call('HSET', KEYS[1], 'seq', seq)

local now = tonumber(ARGV[2])
if ARGV[5] == 'dead_lettered' then
  redis.call('HSET', KEYS[1], 'state', 'dead_lettered', 'finished_at', ARGV[2])
  redis.call('ZADD', KEYS[4], now, ARGV[1])
  local cap = tonumber(ARGV[6])
  local n = redis.call('ZCARD', KEYS[4])
  if n > cap then
    local old = redis.call('ZRANGE', KEYS[4], 0, n - cap - 1)
    for _, oid in ipairs(old) do
      redis.call('DEL', ARGV[7] .. oid)
    end
    redis.call('ZREMRANGEBYRANK', KEYS[4], 0, n - cap - 1)
  end
elseif tonumber(ARGV[3]) > now then
  redis.call('HSET', KEYS[1], 'state', 'delayed')
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('HSET', KEYS[1], 'state', 'waiting')
  redis.call('ZADD', KEYS[2], waiting_score(ARGV[4], seq), ARGV[1])
end
return seq
";

/// KEYS: waiting, delayed, active, paused
/// ARGV: now, lease_until, owner, job prefix
const DEQUEUE: &str = r"
local now = tonumber(ARGV[1])

local function requeue(id)
  local jk = ARGV[4] .. id
  if redis.call('EXISTS', jk) == 1 then
    local fields = redis.call('HMGET', jk, 'priority', 'seq')
    redis.call('HSET', jk, 'state', 'waiting', 'owner', '', 'lease_until', '')
    redis.call('ZADD', KEYS[1], waiting_score(fields[1], fields[2]), id)
  end
end

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  requeue(id)
end

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  requeue(id)
end

if redis.call('EXISTS', KEYS[4]) == 1 then
  return nil
end

local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return nil
end

local id = popped[1]
local jk = ARGV[4] .. id
redis.call('HSET', jk, 'state', 'active', 'owner', ARGV[3], 'lease_until', ARGV[2], 'started_at', ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], id)
return redis.call('HGETALL', jk)
";

/// Shared ownership guard. Returns -1 from the script when the caller
/// no longer holds the lease.
const OWNER_GUARD: &str = r"
local current = redis.call('HMGET', KEYS[1], 'state', 'owner')
if current[1] ~= 'active' or current[2] ~= ARGV[2] then
  return -1
end
";

/// KEYS: job, active
/// ARGV: id, owner, lease_until
const EXTEND_LEASE: &str = r"
redis.call('HSET', KEYS[1], 'lease_until', ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
";

/// KEYS: job, active, target history
/// ARGV: id, owner, now, state, cap, job prefix, attempts_made, last_error
const FINISH: &str = r"
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1],
  'state', ARGV[4],
  'finished_at', ARGV[3],
  'owner', '',
  'lease_until', '',
  'attempts_made', ARGV[7],
  'last_error', ARGV[8])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])

local cap = tonumber(ARGV[5])
local n = redis.call('ZCARD', KEYS[3])
if n > cap then
  local old = redis.call('ZRANGE', KEYS[3], 0, n - cap - 1)
  for _, oid in ipairs(old) do
    redis.call('DEL', ARGV[6] .. oid)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[3], 0, n - cap - 1)
end
return 1
";

/// KEYS: job, active, waiting, delayed
/// ARGV: id, owner, now, available_at, attempts_made, last_error
const RETRY: &str = r"
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1],
  'owner', '',
  'lease_until', '',
  'attempts_made', ARGV[5],
  'last_error', ARGV[6],
  'available_at', ARGV[4])

if tonumber(ARGV[4]) > tonumber(ARGV[3]) then
  redis.call('HSET', KEYS[1], 'state', 'delayed')
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
else
  local fields = redis.call('HMGET', KEYS[1], 'priority', 'seq')
  redis.call('HSET', KEYS[1], 'state', 'waiting')
  redis.call('ZADD', KEYS[3], waiting_score(fields[1], fields[2]), ARGV[1])
end
return 1
";

/// KEYS: job, waiting, delayed
/// ARGV: id, now
/// Returns the state the job was in, or nil if it does not exist.
const PROMOTE: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return nil
end
if state == 'delayed' then
  local fields = redis.call('HMGET', KEYS[1], 'priority', 'seq')
  redis.call('ZREM', KEYS[3], ARGV[1])
  redis.call('HSET', KEYS[1], 'state', 'waiting', 'available_at', ARGV[2])
  redis.call('ZADD', KEYS[2], waiting_score(fields[1], fields[2]), ARGV[1])
end
return state
";

/// KEYS: job, waiting, delayed, completed, failed, dead
/// ARGV: id
/// Returns the removed job's state, `active` if it was refused, or nil.
const REMOVE: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return nil
end
if state == 'active' then
  return state
end
for i = 2, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
redis.call('DEL', KEYS[1])
return state
";

/// KEYS: history
/// ARGV: older_than, limit (0 = all), job prefix
const PURGE: &str = r"
local ids
if tonumber(ARGV[2]) > 0 then
  ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, ARGV[2])
else
  ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
end
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('DEL', ARGV[3] .. id)
end
return ids
";

/// Compiled scripts, hashed once per broker.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub dequeue: Script,
    pub extend_lease: Script,
    pub finish: Script,
    pub retry: Script,
    pub promote: Script,
    pub remove: Script,
    pub purge: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(&format!("{WAITING_SCORE_FN}{ENQUEUE}")),
            dequeue: Script::new(&format!("{WAITING_SCORE_FN}{DEQUEUE}")),
            extend_lease: Script::new(&format!("{OWNER_GUARD}{EXTEND_LEASE}")),
            finish: Script::new(&format!("{OWNER_GUARD}{FINISH}")),
            retry: Script::new(&format!("{WAITING_SCORE_FN}{OWNER_GUARD}{RETRY}")),
            promote: Script::new(&format!("{WAITING_SCORE_FN}{PROMOTE}")),
            remove: Script::new(REMOVE),
            purge: Script::new(PURGE),
        }
    }
}
