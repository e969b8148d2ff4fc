use std::collections::{hash_map::DefaultHasher, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::script::{
    step, BucketArgs, BucketOutcome, BucketReply, StoredBucket, MINUTE_WINDOW_MS,
    TIMESTAMP_TTL_MS,
};
use super::{AtomicScriptStore, BucketKeys, StoreError};

/// Single-process stand-in for the shared store.
///
/// Every evaluation runs under one lock, which gives the same all-or-nothing
/// behaviour the real store provides through script execution. Key expiry is
/// evaluated against the `now` passed with each call.
#[derive(Default)]
pub struct MemoryScriptStore {
    inner: Mutex<MemoryInner>,
    loads: AtomicUsize,
    evaluations: AtomicUsize,
}

#[derive(Default)]
struct MemoryInner {
    scripts: HashSet<String>,
    values: HashMap<String, Entry>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    expires_at_ms: i64,
}

impl MemoryInner {
    fn read(&mut self, key: &str, now_ms: i64) -> Option<f64> {
        match self.values.get(key) {
            Some(entry) if entry.expires_at_ms > now_ms => Some(entry.value),
            Some(_) => {
                self.values.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(&mut self, key: &str, value: f64, expires_at_ms: i64) {
        self.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
    }
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every loaded script, like `SCRIPT FLUSH` or a store restart.
    pub fn flush_scripts(&self) {
        self.inner.lock().scripts.clear();
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Current token count for a bucket, if the key is live at `now_ms`.
    pub fn tokens(&self, keys: &BucketKeys, now_ms: i64) -> Option<f64> {
        self.inner.lock().read(&keys.bucket, now_ms)
    }

    /// Current minute counter for a bucket, if the key is live at `now_ms`.
    pub fn minute_count(&self, keys: &BucketKeys, now_ms: i64) -> Option<i64> {
        self.inner
            .lock()
            .read(&keys.minute, now_ms)
            .map(|count| count as i64)
    }
}

fn digest(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl AtomicScriptStore for MemoryScriptStore {
    async fn load_script(&self, source: &str) -> Result<String, StoreError> {
        let sha = digest(source);
        self.inner.lock().scripts.insert(sha.clone());
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(sha)
    }

    async fn eval_bucket(
        &self,
        digest: &str,
        keys: &BucketKeys,
        args: &BucketArgs,
    ) -> Result<BucketReply, StoreError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if !inner.scripts.contains(digest) {
            return Err(StoreError::NoScript);
        }

        let now = args.now_ms;
        let stored = StoredBucket {
            tokens: inner.read(&keys.bucket, now),
            last_refill_ms: inner.read(&keys.timestamp, now).map(|v| v as i64),
            minute_count: inner.read(&keys.minute, now).map(|v| v as i64),
        };

        let outcome = step(stored, args);
        if let BucketOutcome::Accepted {
            tokens,
            last_refill_ms,
            minute_count,
        } = outcome
        {
            inner.write(&keys.bucket, tokens, now + args.bucket_ttl_ms());
            inner.write(&keys.timestamp, last_refill_ms as f64, now + TIMESTAMP_TTL_MS);
            inner.write(&keys.minute, minute_count as f64, now + MINUTE_WINDOW_MS);
        }

        Ok(outcome.reply())
    }
}
