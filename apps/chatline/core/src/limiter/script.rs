//! Token bucket step shared by every store implementation.
//!
//! [`TOKEN_BUCKET_SCRIPT`] is what a Redis-compatible store executes; [`step`] is the
//! same decision expressed in Rust so the in-memory store (and the tests) run the
//! identical algorithm. Keep the two in lockstep.

/// Lua source executed atomically by the shared store.
///
/// `KEYS`: bucket, timestamp, minute counter.
/// `ARGV`: rate per second, capacity, max per minute, now (ms), tokens requested.
/// Returns `{allowed, tokens_remaining}`.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local bucketKey = KEYS[1]
local timestampKey = KEYS[2]
local minuteKey = KEYS[3]

local ratePerSecond = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local maxPerMinute = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local tokensRequested = tonumber(ARGV[5])

local tokens = tonumber(redis.call('get', bucketKey))
local lastRefill = tonumber(redis.call('get', timestampKey))

if tokens == nil then
  tokens = capacity
end

if lastRefill == nil then
  lastRefill = now
end

local deltaSeconds = math.max(0, (now - lastRefill) / 1000)
local refill = deltaSeconds * ratePerSecond
if refill > 0 then
  tokens = math.min(capacity, tokens + refill)
  lastRefill = now
end

if tokens < tokensRequested then
  return {0, tokens}
end

local minuteCount = tonumber(redis.call('get', minuteKey))
if minuteCount == nil then
  minuteCount = 0
end

if (minuteCount + tokensRequested) > maxPerMinute then
  return {0, tokens}
end

tokens = tokens - tokensRequested
redis.call('set', bucketKey, tokens, 'PX', math.ceil((capacity / ratePerSecond) * 2000))
redis.call('set', timestampKey, now, 'PX', 120000)
redis.call('set', minuteKey, minuteCount + tokensRequested, 'EX', 60)

return {1, tokens}
"#;

/// Expiry applied to the timestamp key.
pub const TIMESTAMP_TTL_MS: i64 = 120_000;

/// Expiry applied to the per-minute counter; renewed on every accepted consume.
pub const MINUTE_WINDOW_MS: i64 = 60_000;

/// Arguments passed to one script execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketArgs {
    pub rate_per_second: f64,
    pub capacity: f64,
    pub max_per_minute: i64,
    pub now_ms: i64,
    pub requested: i64,
}

impl BucketArgs {
    /// Expiry applied to the token key: twice the time needed to refill from empty.
    pub fn bucket_ttl_ms(&self) -> i64 {
        ((self.capacity / self.rate_per_second) * 2000.0).ceil() as i64
    }
}

/// What the script returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketReply {
    pub allowed: bool,
    /// Tokens left after the call, truncated like a Lua number converted to a reply.
    pub tokens: i64,
}

/// Bucket values as read from the store; `None` means the key is absent or expired.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoredBucket {
    pub tokens: Option<f64>,
    pub last_refill_ms: Option<i64>,
    pub minute_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketOutcome {
    Rejected {
        tokens: f64,
    },
    Accepted {
        tokens: f64,
        last_refill_ms: i64,
        minute_count: i64,
    },
}

impl BucketOutcome {
    pub fn reply(&self) -> BucketReply {
        match *self {
            BucketOutcome::Rejected { tokens } => BucketReply {
                allowed: false,
                tokens: tokens as i64,
            },
            BucketOutcome::Accepted { tokens, .. } => BucketReply {
                allowed: true,
                tokens: tokens as i64,
            },
        }
    }
}

/// One bucket decision. Pure: the caller writes the accepted values back.
pub fn step(stored: StoredBucket, args: &BucketArgs) -> BucketOutcome {
    let mut tokens = stored.tokens.unwrap_or(args.capacity);
    let last_refill = stored.last_refill_ms.unwrap_or(args.now_ms);

    let delta_seconds = ((args.now_ms - last_refill) as f64 / 1000.0).max(0.0);
    let refill = delta_seconds * args.rate_per_second;
    if refill > 0.0 {
        tokens = args.capacity.min(tokens + refill);
    }

    let requested = args.requested as f64;
    if tokens < requested {
        return BucketOutcome::Rejected { tokens };
    }

    let minute_count = stored.minute_count.unwrap_or(0);
    if minute_count + args.requested > args.max_per_minute {
        return BucketOutcome::Rejected { tokens };
    }

    BucketOutcome::Accepted {
        tokens: tokens - requested,
        last_refill_ms: args.now_ms,
        minute_count: minute_count + args.requested,
    }
}
