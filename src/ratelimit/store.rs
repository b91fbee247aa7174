use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Counter store with increment-with-TTL semantics. The TTL only applies when
/// the increment creates the bucket.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Returns the count after incrementing and the time left in the window.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<(u64, Duration), StoreError>;
}

struct Bucket {
    count: u64,
    expires_at: Instant,
}

/// Fixed-window counters kept in process memory.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn incr_at(&self, key: &str, ttl: Duration, now: Instant) -> Result<(u64, Duration), StoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::Unavailable("bucket lock poisoned".into()))?;

        // 清理过期的桶
        if buckets.len() > 4096 {
            buckets.retain(|_, b| b.expires_at > now);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            expires_at: now + ttl,
        });
        if bucket.expires_at <= now {
            bucket.count = 0;
            bucket.expires_at = now + ttl;
        }
        bucket.count += 1;
        Ok((bucket.count, bucket.expires_at.saturating_duration_since(now)))
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<(u64, Duration), StoreError> {
        self.incr_at(key, ttl, Instant::now())
    }
}
