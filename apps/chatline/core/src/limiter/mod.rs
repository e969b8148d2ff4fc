//! Outbound rate limiting shared by every gateway process.
//!
//! Bucket state never lives in this process. Each [`AtomicRateLimiter::consume`]
//! call runs [`script::TOKEN_BUCKET_SCRIPT`] on the shared store, which refills,
//! checks both the token balance and the per-minute ceiling, and writes the result
//! back as one indivisible operation. Two gateways that share a protocol account
//! therefore draw from the same bucket without double-spending.

mod memory;
pub mod script;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub use memory::MemoryScriptStore;
pub use script::{BucketArgs, BucketReply, TOKEN_BUCKET_SCRIPT};

pub const DEFAULT_KEY_PREFIX: &str = "chatline:bucket";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store has no script cached under the digest we sent.
    #[error("script not loaded")]
    NoScript,
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded")]
    Exceeded,
    #[error("rate limiter store failure: {0}")]
    Store(String),
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        RateLimitError::Store(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BucketConfigError {
    #[error("rate per second must be a positive number, got {0}")]
    Rate(f64),
    #[error("burst capacity must be at least 1")]
    Burst,
    #[error("per-minute ceiling must be at least 1")]
    PerMinute,
}

/// Store capable of caching a script and executing it atomically.
#[async_trait]
pub trait AtomicScriptStore: Send + Sync {
    /// Cache `source` on the store and return the digest used to invoke it.
    async fn load_script(&self, source: &str) -> Result<String, StoreError>;

    /// Execute the cached bucket script. Must fail with [`StoreError::NoScript`] when
    /// `digest` is unknown to the store.
    async fn eval_bucket(
        &self,
        digest: &str,
        keys: &BucketKeys,
        args: &BucketArgs,
    ) -> Result<BucketReply, StoreError>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-session bucket constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate_per_second: f64,
    pub burst: u32,
    pub max_per_minute: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 1.0,
            burst: 5,
            max_per_minute: 50,
        }
    }
}

impl BucketConfig {
    pub fn validate(&self) -> Result<(), BucketConfigError> {
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(BucketConfigError::Rate(self.rate_per_second));
        }
        if self.burst == 0 {
            return Err(BucketConfigError::Burst);
        }
        if self.max_per_minute == 0 {
            return Err(BucketConfigError::PerMinute);
        }
        Ok(())
    }
}

/// Store keys holding one session's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub bucket: String,
    pub timestamp: String,
    pub minute: String,
}

impl BucketKeys {
    pub fn for_session(prefix: &str, session_id: &str) -> Self {
        let base = format!("{prefix}:{session_id}");
        Self {
            bucket: format!("{base}:bucket"),
            timestamp: format!("{base}:timestamp"),
            minute: format!("{base}:minute"),
        }
    }

    pub fn as_array(&self) -> [&str; 3] {
        [&self.bucket, &self.timestamp, &self.minute]
    }
}

pub struct AtomicRateLimiter {
    store: Arc<dyn AtomicScriptStore>,
    clock: Arc<dyn Clock>,
    config: BucketConfig,
    key_prefix: String,
    digest: Mutex<Option<String>>,
}

impl fmt::Debug for AtomicRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicRateLimiter")
            .field("config", &self.config)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl AtomicRateLimiter {
    pub fn new(store: Arc<dyn AtomicScriptStore>, config: BucketConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            digest: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn config(&self) -> BucketConfig {
        self.config
    }

    pub fn keys_for(&self, session_id: &str) -> BucketKeys {
        BucketKeys::for_session(&self.key_prefix, session_id)
    }

    /// Spend `tokens` from the session's bucket or fail without touching it.
    pub async fn consume(&self, session_id: &str, tokens: u32) -> Result<(), RateLimitError> {
        let keys = self.keys_for(session_id);
        let args = BucketArgs {
            rate_per_second: self.config.rate_per_second,
            capacity: self.config.burst as f64,
            max_per_minute: self.config.max_per_minute as i64,
            now_ms: self.clock.now_millis(),
            requested: tokens as i64,
        };

        let reply = match self.eval(&keys, &args).await {
            Err(StoreError::NoScript) => {
                debug!(session_id = %session_id, "bucket script missing on store; reloading");
                self.digest.lock().take();
                self.eval(&keys, &args).await
            }
            other => other,
        }
        .map_err(|err| {
            warn!(session_id = %session_id, error = %err, "rate limiter store call failed");
            RateLimitError::from(err)
        })?;

        if reply.allowed {
            Ok(())
        } else {
            counter!(
                "chatline_rate_limited_total",
                1,
                "session_id" => session_id.to_string()
            );
            debug!(
                session_id = %session_id,
                tokens_left = reply.tokens,
                "outbound send rejected by rate limiter"
            );
            Err(RateLimitError::Exceeded)
        }
    }

    async fn eval(&self, keys: &BucketKeys, args: &BucketArgs) -> Result<BucketReply, StoreError> {
        let digest = self.loaded_digest().await?;
        self.store.eval_bucket(&digest, keys, args).await
    }

    async fn loaded_digest(&self) -> Result<String, StoreError> {
        let cached = self.digest.lock().clone();
        if let Some(digest) = cached {
            return Ok(digest);
        }
        let digest = self.store.load_script(TOKEN_BUCKET_SCRIPT).await?;
        *self.digest.lock() = Some(digest.clone());
        Ok(digest)
    }
}
