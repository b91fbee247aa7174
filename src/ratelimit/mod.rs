pub mod notify;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

pub use notify::{NoopNotifier, RateLimitNotifier, WebhookNotifier};
pub use store::{MemoryRateLimitStore, RateLimitStore};

use crate::actor::{Actor, Feature, RateLimit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Exceeded {
        used: u64,
        limit: u64,
        /// `None` when the store could not tell how long the window has left.
        retry_after: Option<Duration>,
    },
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn key(actor: &Actor, feature: Feature) -> String {
        format!("{}:{}", feature, actor.id)
    }

    /// Consumes one request from the actor's bucket. Store failures let the
    /// request through.
    pub async fn try_acquire(&self, actor: &Actor, feature: Feature, limit: &RateLimit) -> Decision {
        let key = Self::key(actor, feature);
        match self.store.incr(&key, limit.interval).await {
            Ok((count, remaining)) if count > limit.limit => Decision::Exceeded {
                used: count,
                limit: limit.limit,
                retry_after: (!remaining.is_zero()).then_some(remaining),
            },
            Ok(_) => Decision::Allowed,
            Err(e) => {
                tracing::error!(actor = %actor.id, %feature, error = %e, "rate limit check failed, allowing request");
                Decision::Allowed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::store::StoreError;
    use super::*;

    fn actor() -> Actor {
        Actor {
            id: "a-1".into(),
            source: "static".into(),
            dotcom: false,
            rate_limits: HashMap::new(),
        }
    }

    fn limit(n: u64) -> RateLimit {
        RateLimit {
            limit: n,
            interval: Duration::from_secs(60),
            allowed_models: vec![],
        }
    }

    #[tokio::test]
    async fn exceeds_after_limit() {
        let limiter = RateLimiter::new(Arc::new(MemoryRateLimitStore::new()));
        let a = actor();
        for _ in 0..2 {
            assert_eq!(limiter.try_acquire(&a, Feature::ChatCompletions, &limit(2)).await, Decision::Allowed);
        }
        match limiter.try_acquire(&a, Feature::ChatCompletions, &limit(2)).await {
            Decision::Exceeded { used, limit, retry_after } => {
                assert_eq!((used, limit), (3, 2));
                assert!(retry_after.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        // 不同 feature 独立计数
        assert_eq!(limiter.try_acquire(&a, Feature::CodeCompletions, &limit(2)).await, Decision::Allowed);
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<(u64, Duration), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        assert_eq!(limiter.try_acquire(&actor(), Feature::ChatCompletions, &limit(0)).await, Decision::Allowed);
    }
}
