//! Redis-backed limiter store and inbound queue.

use async_trait::async_trait;
use chatline_core::inbound::{InboundJob, InboundQueue, QueueError};
use chatline_core::limiter::{AtomicScriptStore, BucketArgs, BucketKeys, BucketReply, StoreError};
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};

pub const DEFAULT_QUEUE_PREFIX: &str = "chatline:queue";

/// Runs the bucket script through `SCRIPT LOAD` / `EVALSHA`.
#[derive(Clone)]
pub struct RedisScriptStore {
    redis: ConnectionManager,
}

impl RedisScriptStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

fn store_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::NoScriptError {
        StoreError::NoScript
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn parse_reply(values: &[i64]) -> Result<BucketReply, StoreError> {
    match values {
        [allowed, tokens, ..] => Ok(BucketReply {
            allowed: *allowed == 1,
            tokens: *tokens,
        }),
        _ => Err(StoreError::Backend(format!(
            "unexpected bucket script reply: {values:?}"
        ))),
    }
}

#[async_trait]
impl AtomicScriptStore for RedisScriptStore {
    async fn load_script(&self, source: &str) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let digest: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(digest)
    }

    async fn eval_bucket(
        &self,
        digest: &str,
        keys: &BucketKeys,
        args: &BucketArgs,
    ) -> Result<BucketReply, StoreError> {
        let mut conn = self.redis.clone();
        let values: Vec<i64> = redis::cmd("EVALSHA")
            .arg(digest)
            .arg(3)
            .arg(&keys.bucket)
            .arg(&keys.timestamp)
            .arg(&keys.minute)
            .arg(args.rate_per_second)
            .arg(args.capacity)
            .arg(args.max_per_minute)
            .arg(args.now_ms)
            .arg(args.requested)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        parse_reply(&values)
    }
}

/// Pushes inbound jobs onto a Redis list consumed by the processing worker.
#[derive(Clone)]
pub struct RedisInboundQueue {
    redis: ConnectionManager,
    key: String,
}

impl RedisInboundQueue {
    pub fn new(redis: ConnectionManager, prefix: &str, queue: &str) -> Self {
        Self {
            redis,
            key: queue_key(prefix, queue),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

pub fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:{queue}")
}

fn encode_jobs(jobs: &[InboundJob]) -> Result<Vec<String>, QueueError> {
    jobs.iter()
        .map(|job| serde_json::to_string(job).map_err(|err| QueueError::Encode(err.to_string())))
        .collect()
}

#[async_trait]
impl InboundQueue for RedisInboundQueue {
    async fn enqueue_batch(&self, jobs: Vec<InboundJob>) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let payloads = encode_jobs(&jobs)?;
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(payloads)
            .query_async(&mut conn)
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let depth: u64 = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn noscript_is_distinguished_from_other_failures() {
        let missing = RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT"));
        assert!(matches!(store_error(missing), StoreError::NoScript));

        let refused = RedisError::from((ErrorKind::IoError, "connection refused"));
        assert!(matches!(store_error(refused), StoreError::Backend(_)));
    }

    #[test]
    fn script_reply_is_allowed_flag_then_tokens() {
        assert_eq!(
            parse_reply(&[1, 4]).unwrap(),
            BucketReply {
                allowed: true,
                tokens: 4
            }
        );
        assert!(!parse_reply(&[0, 0]).unwrap().allowed);
        assert!(parse_reply(&[1]).is_err());
    }

    #[test]
    fn queue_key_joins_prefix_and_name() {
        assert_eq!(
            queue_key(DEFAULT_QUEUE_PREFIX, "CHAT_INBOUND"),
            "chatline:queue:CHAT_INBOUND"
        );
    }

    #[test]
    fn jobs_are_encoded_one_payload_each() {
        let jobs = vec![
            InboundJob::new("branch-1", json!({"id": 1}), Utc::now()),
            InboundJob::new("branch-1", json!({"id": 2}), Utc::now()),
        ];
        let payloads = encode_jobs(&jobs).unwrap();
        assert_eq!(payloads.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(first["name"], "wa-message");
        assert_eq!(first["data"]["message"]["id"], 1);
    }
}
