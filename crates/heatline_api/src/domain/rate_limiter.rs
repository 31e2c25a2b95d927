use common::domain::{
    check_bucket, BucketStore, DomainError, DomainResult, InMemoryBucketStore, RateLimitDecision,
    RateLimitPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Applied per `route:client_ip`
    pub ip_policy: RateLimitPolicy,
    /// Applied per device once authenticated; `None` disables the check
    pub device_policy: Option<RateLimitPolicy>,
    /// Upper bound on each call to the shared store
    pub store_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            ip_policy: RateLimitPolicy::per_minute(120, 60),
            device_policy: Some(RateLimitPolicy::per_minute(60, 60)),
            store_timeout: Duration::from_millis(250),
        }
    }
}

/// Token-bucket rate limiter over a shared bucket store.
///
/// When the shared store errors or exceeds its timeout, the check runs
/// against the in-process fallback store instead. Concurrent checks on one
/// key may both read the same token count and both pass; that race only ever
/// grants an extra request.
pub struct RateLimiter {
    primary: Option<Arc<dyn BucketStore>>,
    fallback: Arc<InMemoryBucketStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(
        primary: Option<Arc<dyn BucketStore>>,
        fallback: Arc<InMemoryBucketStore>,
        config: RateLimiterConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            config,
        }
    }

    /// In-process limiter with no shared store
    pub fn in_memory(config: RateLimiterConfig) -> Self {
        Self::new(None, Arc::new(InMemoryBucketStore::default()), config)
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Apply one request against the bucket at `key`
    #[instrument(skip(self, policy), fields(key = %key))]
    pub async fn check(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64) -> RateLimitDecision {
        if let Some(primary) = &self.primary {
            let checked = tokio::time::timeout(
                self.config.store_timeout,
                check_in_store(primary.as_ref(), key, policy, now_ms),
            )
            .await;

            match checked {
                Ok(Ok(decision)) => return decision,
                Ok(Err(e)) => {
                    warn!(error = %e, "rate limit store failed, using in-process fallback");
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.store_timeout.as_millis() as u64,
                        "rate limit store timed out, using in-process fallback"
                    );
                }
            }
        }

        match check_in_store(self.fallback.as_ref(), key, policy, now_ms).await {
            Ok(decision) => decision,
            // The in-memory store does not fail; allow rather than deny if it ever does
            Err(e) => {
                warn!(error = %e, "fallback rate limit store failed");
                RateLimitDecision::Allowed { remaining: 0 }
            }
        }
    }

    /// Per `route:client_ip` limit, applied before the body is read
    pub async fn check_ip(&self, route: &str, client_ip: &str, now_ms: i64) -> DomainResult<()> {
        let key = format!("{}:{}", route, client_ip);
        into_result(self.check(&key, &self.config.ip_policy, now_ms).await)
    }

    /// Per-device limit, applied after authentication
    pub async fn check_device(&self, device_id: &str, now_ms: i64) -> DomainResult<()> {
        let Some(policy) = self.config.device_policy else {
            return Ok(());
        };
        let key = format!("device:{}", device_id);
        into_result(self.check(&key, &policy, now_ms).await)
    }
}

async fn check_in_store(
    store: &dyn BucketStore,
    key: &str,
    policy: &RateLimitPolicy,
    now_ms: i64,
) -> DomainResult<RateLimitDecision> {
    let bucket = store.get(key).await?;
    let (bucket, decision) = check_bucket(bucket, policy, now_ms);
    store.put(key, bucket).await?;
    Ok(decision)
}

fn into_result(decision: RateLimitDecision) -> DomainResult<()> {
    match decision {
        RateLimitDecision::Allowed { remaining } => {
            debug!(remaining, "rate limit check passed");
            Ok(())
        }
        RateLimitDecision::Limited { retry_after_secs } => {
            Err(DomainError::RateLimited { retry_after_secs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{MockBucketStore, RateLimitBucket};

    fn config() -> RateLimiterConfig {
        RateLimiterConfig {
            ip_policy: RateLimitPolicy::per_minute(2, 60),
            device_policy: Some(RateLimitPolicy::per_minute(1, 30)),
            store_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_allow_allow_deny_per_ip() {
        let limiter = RateLimiter::in_memory(config());

        assert!(limiter.check_ip("ingest", "10.0.0.1", 0).await.is_ok());
        assert!(limiter.check_ip("ingest", "10.0.0.1", 100).await.is_ok());
        let denied = limiter.check_ip("ingest", "10.0.0.1", 200).await;
        assert!(matches!(
            denied,
            Err(DomainError::RateLimited { retry_after_secs: 60 })
        ));

        // Other clients and routes keep their own buckets
        assert!(limiter.check_ip("ingest", "10.0.0.2", 200).await.is_ok());
        assert!(limiter.check_ip("heartbeat", "10.0.0.1", 200).await.is_ok());

        // Past the block and refill interval
        assert!(limiter.check_ip("ingest", "10.0.0.1", 60_300).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_limit_disabled() {
        let limiter = RateLimiter::in_memory(RateLimiterConfig {
            device_policy: None,
            ..config()
        });

        for at in 0..5 {
            assert!(limiter.check_device("hp-1", at).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_primary_store_is_used_when_healthy() {
        let mut primary = MockBucketStore::new();
        primary
            .expect_get()
            .withf(|key: &str| key == "device:hp-1")
            .times(1)
            .return_once(|_| {
                Ok(Some(RateLimitBucket {
                    tokens: 0,
                    last_refill_ms: 0,
                    blocked_until_ms: None,
                }))
            });
        primary
            .expect_put()
            .withf(|key: &str, bucket: &RateLimitBucket| {
                key == "device:hp-1" && bucket.blocked_until_ms == Some(30_010)
            })
            .times(1)
            .return_once(|_, _| Ok(()));

        let fallback = Arc::new(InMemoryBucketStore::default());
        let limiter = RateLimiter::new(Some(Arc::new(primary)), fallback.clone(), config());

        let result = limiter.check_device("hp-1", 10).await;
        assert!(matches!(result, Err(DomainError::RateLimited { .. })));
        assert!(fallback.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_error_falls_back_to_memory() {
        let mut primary = MockBucketStore::new();
        primary.expect_get().returning(|_| {
            Err(DomainError::RepositoryError(anyhow::anyhow!(
                "kv unavailable"
            )))
        });

        let fallback = Arc::new(InMemoryBucketStore::default());
        let limiter = RateLimiter::new(Some(Arc::new(primary)), fallback.clone(), config());

        assert!(limiter.check_ip("ingest", "10.0.0.1", 0).await.is_ok());
        assert!(limiter.check_ip("ingest", "10.0.0.1", 1).await.is_ok());
        assert!(limiter.check_ip("ingest", "10.0.0.1", 2).await.is_err());
        assert_eq!(fallback.len().await, 1);
    }

    struct HangingStore;

    #[async_trait::async_trait]
    impl BucketStore for HangingStore {
        async fn get(&self, _key: &str) -> DomainResult<Option<RateLimitBucket>> {
            std::future::pending().await
        }

        async fn put(&self, _key: &str, _bucket: RateLimitBucket) -> DomainResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_falls_back_to_memory() {
        let fallback = Arc::new(InMemoryBucketStore::default());
        let limiter = RateLimiter::new(Some(Arc::new(HangingStore)), fallback.clone(), config());

        assert!(limiter.check_device("hp-1", 0).await.is_ok());
        assert!(fallback.get("device:hp-1").await.unwrap().is_some());
    }
}
