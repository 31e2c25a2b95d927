//! Token-bucket rate limiting primitives.
//!
//! Refill is lazy: each check adds the tokens accrued since the last refill,
//! so no background timer is needed. Bucket state lives behind the
//! [`BucketStore`] trait so the same algorithm runs against a shared durable
//! store or the in-process fallback.

use crate::domain::result::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub tokens: u32,
    pub last_refill_ms: i64,
    pub blocked_until_ms: Option<i64>,
}

impl RateLimitBucket {
    pub fn full(policy: &RateLimitPolicy, now_ms: i64) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill_ms: now_ms,
            blocked_until_ms: None,
        }
    }
}

/// Bucket parameters for one class of key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum tokens, i.e. requests allowed per refill interval
    pub capacity: u32,
    pub refill_interval_ms: i64,
    /// How long a bucket stays blocked once exhausted
    pub block_duration_ms: i64,
}

impl RateLimitPolicy {
    pub fn per_minute(capacity: u32, block_duration_secs: u64) -> Self {
        Self {
            capacity,
            refill_interval_ms: 60_000,
            block_duration_ms: block_duration_secs as i64 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

fn ceil_secs(ms: i64) -> u64 {
    (ms.max(0) as u64).div_ceil(1_000).max(1)
}

/// Apply one request to `bucket` and return the new state with the decision.
///
/// A missing bucket starts full.
pub fn check_bucket(
    bucket: Option<RateLimitBucket>,
    policy: &RateLimitPolicy,
    now_ms: i64,
) -> (RateLimitBucket, RateLimitDecision) {
    let mut bucket = bucket.unwrap_or_else(|| RateLimitBucket::full(policy, now_ms));

    if let Some(blocked_until) = bucket.blocked_until_ms {
        if blocked_until > now_ms {
            let retry_after_secs = ceil_secs(blocked_until - now_ms);
            return (bucket, RateLimitDecision::Limited { retry_after_secs });
        }
        bucket.blocked_until_ms = None;
    }

    if policy.refill_interval_ms > 0 {
        let elapsed = (now_ms - bucket.last_refill_ms).max(0) as i128;
        let accrued = elapsed * i128::from(policy.capacity) / i128::from(policy.refill_interval_ms);
        if accrued > 0 {
            let refilled = (i128::from(bucket.tokens) + accrued).min(i128::from(policy.capacity));
            bucket.tokens = refilled as u32;
            bucket.last_refill_ms = now_ms;
        }
    }

    if bucket.tokens > 0 {
        bucket.tokens -= 1;
        (
            bucket,
            RateLimitDecision::Allowed {
                remaining: bucket.tokens,
            },
        )
    } else {
        bucket.blocked_until_ms = Some(now_ms + policy.block_duration_ms);
        (
            bucket,
            RateLimitDecision::Limited {
                retry_after_secs: ceil_secs(policy.block_duration_ms),
            },
        )
    }
}

/// Key-value storage for rate-limit buckets
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, key: &str) -> DomainResult<Option<RateLimitBucket>>;

    async fn put(&self, key: &str, bucket: RateLimitBucket) -> DomainResult<()>;
}

/// In-process `BucketStore` backed by a `HashMap`.
///
/// Used as the fallback when the shared store is unreachable. Memory is
/// bounded by [`InMemoryBucketStore::sweep`] and by `max_entries`.
pub struct InMemoryBucketStore {
    buckets: RwLock<HashMap<String, RateLimitBucket>>,
    max_entries: usize,
}

impl InMemoryBucketStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Drop buckets that are not blocked and have not been touched for
    /// `idle_ms`. Such a bucket would refill to capacity on its next check,
    /// so dropping it is equivalent to keeping it.
    pub async fn sweep(&self, now_ms: i64, idle_ms: i64) -> usize {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let blocked = bucket.blocked_until_ms.is_some_and(|until| until > now_ms);
            blocked || now_ms - bucket.last_refill_ms < idle_ms
        });
        before - buckets.len()
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get(&self, key: &str) -> DomainResult<Option<RateLimitBucket>> {
        let buckets = self.buckets.read().await;
        Ok(buckets.get(key).copied())
    }

    async fn put(&self, key: &str, bucket: RateLimitBucket) -> DomainResult<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.len() >= self.max_entries && !buckets.contains_key(key) {
            // Evict the least recently refilled bucket
            if let Some(oldest) = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_refill_ms)
                .map(|(k, _)| k.clone())
            {
                buckets.remove(&oldest);
            }
        }
        buckets.insert(key.to_string(), bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::per_minute(2, 60)
    }

    #[test]
    fn test_allow_allow_deny_then_recover() {
        let policy = policy();

        let (bucket, first) = check_bucket(None, &policy, 0);
        assert_eq!(first, RateLimitDecision::Allowed { remaining: 1 });

        let (bucket, second) = check_bucket(Some(bucket), &policy, 10);
        assert_eq!(second, RateLimitDecision::Allowed { remaining: 0 });

        let (bucket, third) = check_bucket(Some(bucket), &policy, 20);
        assert_eq!(third, RateLimitDecision::Limited { retry_after_secs: 60 });
        assert_eq!(bucket.blocked_until_ms, Some(60_020));

        // Still blocked halfway through
        let (bucket, blocked) = check_bucket(Some(bucket), &policy, 30_020);
        assert_eq!(blocked, RateLimitDecision::Limited { retry_after_secs: 30 });

        // Past the refill interval and the block
        let (_, recovered) = check_bucket(Some(bucket), &policy, 61_000);
        assert!(recovered.is_allowed());
    }

    #[test]
    fn test_partial_refill_is_proportional() {
        let policy = RateLimitPolicy::per_minute(60, 60);
        let bucket = RateLimitBucket {
            tokens: 0,
            last_refill_ms: 0,
            blocked_until_ms: None,
        };

        // 10 seconds at 60/min accrues 10 tokens, one is consumed
        let (bucket, decision) = check_bucket(Some(bucket), &policy, 10_000);
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 9 });
        assert_eq!(bucket.last_refill_ms, 10_000);
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let policy = policy();
        let bucket = RateLimitBucket {
            tokens: 1,
            last_refill_ms: 0,
            blocked_until_ms: None,
        };

        let (bucket, _) = check_bucket(Some(bucket), &policy, 3_600_000);
        assert_eq!(bucket.tokens, 1);
    }

    #[test]
    fn test_clock_skew_does_not_add_tokens() {
        let policy = policy();
        let bucket = RateLimitBucket {
            tokens: 0,
            last_refill_ms: 10_000,
            blocked_until_ms: None,
        };

        let (_, decision) = check_bucket(Some(bucket), &policy, 5_000);
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_in_memory_store_get_put() {
        let store = InMemoryBucketStore::default();
        assert_eq!(store.get("ingest:1.2.3.4").await.unwrap(), None);

        let bucket = RateLimitBucket::full(&policy(), 0);
        store.put("ingest:1.2.3.4", bucket).await.unwrap();
        assert_eq!(store.get("ingest:1.2.3.4").await.unwrap(), Some(bucket));
    }

    #[tokio::test]
    async fn test_sweep_keeps_blocked_and_recent_buckets() {
        let store = InMemoryBucketStore::default();
        let idle = RateLimitBucket {
            tokens: 1,
            last_refill_ms: 0,
            blocked_until_ms: None,
        };
        let blocked = RateLimitBucket {
            tokens: 0,
            last_refill_ms: 0,
            blocked_until_ms: Some(200_000),
        };
        let recent = RateLimitBucket {
            tokens: 1,
            last_refill_ms: 100_000,
            blocked_until_ms: None,
        };
        store.put("idle", idle).await.unwrap();
        store.put("blocked", blocked).await.unwrap();
        store.put("recent", recent).await.unwrap();

        let removed = store.sweep(120_000, 60_000).await;

        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 2);
        assert!(store.get("idle").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_entries_evicts_oldest() {
        let store = InMemoryBucketStore::new(2);
        let at = |ms| RateLimitBucket {
            tokens: 1,
            last_refill_ms: ms,
            blocked_until_ms: None,
        };
        store.put("a", at(1)).await.unwrap();
        store.put("b", at(2)).await.unwrap();
        store.put("c", at(3)).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }
}
