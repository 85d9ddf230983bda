//! Rate-limited, priority-aware work queue over Redis.
//!
//! Every multi-step state transition (push, pop including the throttle
//! decision, dethrottle promotion) runs as a single server-side Lua
//! script. The scripts are the only synchronization between worker
//! processes; no process-local locks exist.
//!
//! Redis layout for a queue named `q`:
//! - `q:active` — zset of destination tokens, score = epoch second of the
//!   next eligible send.
//! - `q:throttled` — zset of destination tokens, score = epoch second the
//!   rate window clears.
//! - `q:{channel}|{rate}/1` and `/0` — per-tier payload zsets (default and
//!   bulk), scores are insertion timestamps.
//! - `q:transactions:{token}` — zset counting sends in the rolling second,
//!   score = epoch ms.

pub mod dethrottler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::trace;

use crate::types::MsgPriority;

/// Errors from the queue engine.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Redis command or script failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A script returned a reply the engine does not understand.
    #[error("unexpected script reply: {0}")]
    BadReply(String),
}

/// A destination token: `{queue}:{channelUUID}|{rate}`.
///
/// Identifies one per-channel queue inside the active and throttled sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerToken(String);

impl WorkerToken {
    /// Build a token for the given queue, channel key and rate limit.
    pub fn new(queue: &str, channel_uuid: &str, rate: u32) -> Self {
        Self(format!("{queue}:{channel_uuid}|{rate}"))
    }

    /// Wrap a raw token string returned by a script.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The rate limit encoded in the token, if it parses.
    pub fn rate(&self) -> Option<u32> {
        self.0.rsplit('|').next()?.parse().ok()
    }
}

impl std::fmt::Display for WorkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a pop attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    /// A work item was handed off to this caller and no other.
    Item {
        /// Destination token the payload came from.
        token: WorkerToken,
        /// The opaque payload that was pushed.
        payload: String,
    },
    /// No destination has eligible work.
    Empty,
    /// Lost a race or hit a rate window; pop again immediately.
    Retry,
}

/// The queue contract workers and the backend program against.
///
/// The production implementation is [`RedisQueue`]; tests substitute
/// in-process fakes at this seam.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a payload for a destination channel at the given priority.
    async fn push(
        &self,
        channel_uuid: &str,
        rate: u32,
        payload: &str,
        priority: MsgPriority,
    ) -> Result<(), QueueError>;

    /// Take the next eligible payload across all destinations, fairly.
    async fn pop(&self) -> Result<Pop, QueueError>;

    /// Record completion of a popped item.
    async fn complete(&self, token: &WorkerToken) -> Result<(), QueueError>;

    /// Promote all throttled destinations whose window has cleared.
    ///
    /// Returns the number promoted. Idempotent; safe to run from several
    /// processes at once. Normally driven by the dethrottler task.
    async fn dethrottle(&self) -> Result<u64, QueueError>;
}

// Push: append to the tier zset, then activate the destination unless it
// is serving a throttle cooldown.
//
// KEYS[1] = active zset, KEYS[2] = throttled zset, KEYS[3] = tier zset
// ARGV[1] = insertion score, ARGV[2] = payload, ARGV[3] = token, ARGV[4] = now (s)
const PUSH_LUA: &str = r#"
redis.call("ZADD", KEYS[3], ARGV[1], ARGV[2])
if not redis.call("ZSCORE", KEYS[2], ARGV[3]) then
    redis.call("ZADD", KEYS[1], ARGV[4], ARGV[3])
end
return 1
"#;

// Pop: find the earliest eligible destination, enforce its rate window,
// take the highest-priority payload, splitting compound JSON arrays so
// one element is returned per call.
//
// KEYS[1] = active zset, KEYS[2] = throttled zset
// ARGV[1] = now (s), ARGV[2] = now (ms), ARGV[3] = transaction key prefix
// Returns {token, payload}, {"empty", ""} or {"retry", ""}.
const POP_LUA: &str = r#"
local active = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "WITHSCORES", "LIMIT", 0, 1)
if #active == 0 then
    return {"empty", ""}
end
local token = active[1]
local rate = tonumber(string.match(token, "|(%d+)$"))
local txKey = ARGV[3] .. token

if rate and rate > 0 then
    local sent = redis.call("ZCOUNT", txKey, ARGV[2] - 1000, "+inf")
    if sent >= rate then
        redis.call("ZREM", KEYS[1], token)
        redis.call("ZADD", KEYS[2], ARGV[1] + 1, token)
        return {"retry", ""}
    end
end

local payload = nil
for _, tier in ipairs({token .. "/1", token .. "/0"}) do
    local item = redis.call("ZRANGE", tier, 0, 0, "WITHSCORES")
    if #item > 0 then
        payload = item[1]
        local score = tonumber(item[2])
        redis.call("ZREM", tier, payload)
        if string.sub(payload, 1, 1) == "[" then
            local parts = cjson.decode(payload)
            payload = cjson.encode(parts[1])
            table.remove(parts, 1)
            if #parts > 0 then
                redis.call("ZADD", tier, score - 1, cjson.encode(parts))
            end
        end
        break
    end
end

if not payload then
    redis.call("ZREM", KEYS[1], token)
    return {"retry", ""}
end

local seq = redis.call("INCR", txKey .. ":seq")
redis.call("EXPIRE", txKey .. ":seq", 10)
redis.call("ZADD", txKey, ARGV[2], seq)
redis.call("ZREMRANGEBYSCORE", txKey, "-inf", ARGV[2] - 5000)
redis.call("EXPIRE", txKey, 10)

if redis.call("ZCARD", token .. "/1") == 0 and redis.call("ZCARD", token .. "/0") == 0 then
    redis.call("ZREM", KEYS[1], token)
else
    redis.call("ZADD", KEYS[1], ARGV[1], token)
end

return {token, payload}
"#;

// Dethrottle: move every due throttled destination back to active,
// keeping its score.
//
// KEYS[1] = throttled zset, KEYS[2] = active zset; ARGV[1] = now (s)
const DETHROTTLE_LUA: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "WITHSCORES")
for i = 1, #due, 2 do
    redis.call("ZADD", KEYS[2], due[i + 1], due[i])
    redis.call("ZREM", KEYS[1], due[i])
end
return #due / 2
"#;

/// The production queue engine backed by Redis Lua scripts.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    name: String,
    push_script: Script,
    pop_script: Script,
    dethrottle_script: Script,
}

impl RedisQueue {
    /// Connect to Redis and build a queue engine for the named queue.
    pub async fn connect(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn, name))
    }

    /// Build a queue engine over an existing connection.
    pub fn new(conn: MultiplexedConnection, name: &str) -> Self {
        Self {
            conn,
            name: name.to_owned(),
            push_script: Script::new(PUSH_LUA),
            pop_script: Script::new(POP_LUA),
            dethrottle_script: Script::new(DETHROTTLE_LUA),
        }
    }

    /// The logical queue name, used to prefix every Redis key.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.name)
    }

    fn throttled_key(&self) -> String {
        format!("{}:throttled", self.name)
    }

    fn transaction_prefix(&self) -> String {
        format!("{}:transactions:", self.name)
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn push(
        &self,
        channel_uuid: &str,
        rate: u32,
        payload: &str,
        priority: MsgPriority,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let token = WorkerToken::new(&self.name, channel_uuid, rate);
        let tier_key = format!("{}/{}", token.as_str(), priority.tier());

        let mut conn = self.conn.clone();
        let _: i64 = self
            .push_script
            .key(self.active_key())
            .key(self.throttled_key())
            .key(tier_key)
            .arg(insertion_score(now))
            .arg(payload)
            .arg(token.as_str())
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await?;

        trace!(token = %token, priority = %priority, "payload pushed");
        Ok(())
    }

    async fn pop(&self) -> Result<Pop, QueueError> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .pop_script
            .key(self.active_key())
            .key(self.throttled_key())
            .arg(now.timestamp())
            .arg(now.timestamp_millis())
            .arg(self.transaction_prefix())
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("empty") => Ok(Pop::Empty),
            Some("retry") => Ok(Pop::Retry),
            Some(token) if reply.len() == 2 => Ok(Pop::Item {
                token: WorkerToken::from_raw(token),
                payload: reply[1].clone(),
            }),
            _ => Err(QueueError::BadReply(format!("{reply:?}"))),
        }
    }

    async fn complete(&self, token: &WorkerToken) -> Result<(), QueueError> {
        // The rate window bookkeeping already happened at pop time; this
        // is the hook for future per-message accounting.
        trace!(token = %token, "completion recorded");
        Ok(())
    }

    async fn dethrottle(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let promoted: u64 = self
            .dethrottle_script
            .key(self.throttled_key())
            .key(self.active_key())
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }
}

/// Microsecond-precision epoch score; FIFO within a tier falls out of
/// the monotonic clock.
fn insertion_score(now: DateTime<Utc>) -> String {
    format!("{:.6}", now.timestamp_micros() as f64 / 1_000_000.0)
}
