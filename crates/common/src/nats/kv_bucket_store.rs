use crate::domain::{BucketStore, DomainError, DomainResult, RateLimitBucket};
use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

/// `BucketStore` backed by a NATS JetStream KV bucket.
///
/// Shared by every instance. Idle buckets expire through the KV bucket's
/// `max_age`, which should be at least the refill interval.
#[derive(Clone)]
pub struct NatsKvBucketStore {
    store: kv::Store,
}

impl NatsKvBucketStore {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }
}

/// Map a limiter key onto the KV key alphabet `[-/_=.a-zA-Z0-9]`
pub fn kv_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '/' | '_' | '=' | '.' => c,
            _ => '_',
        })
        .collect();
    sanitized.trim_matches('.').to_string()
}

#[async_trait]
impl BucketStore for NatsKvBucketStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> DomainResult<Option<RateLimitBucket>> {
        let entry = self
            .store
            .get(kv_key(key))
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        match entry {
            Some(bytes) => {
                let bucket = serde_json::from_slice(&bytes)
                    .map_err(|e| DomainError::RepositoryError(e.into()))?;
                Ok(Some(bucket))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, bucket))]
    async fn put(&self, key: &str, bucket: RateLimitBucket) -> DomainResult<()> {
        let value = serde_json::to_vec(&bucket).map_err(|e| DomainError::RepositoryError(e.into()))?;
        self.store
            .put(kv_key(key), Bytes::from(value))
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_key_sanitizes_ip_keys() {
        assert_eq!(kv_key("ingest:203.0.113.7"), "ingest_203.0.113.7");
        assert_eq!(kv_key("ingest:2001:db8::1"), "ingest_2001_db8__1");
        assert_eq!(kv_key("device:hp-0042"), "device_hp-0042");
        assert_eq!(kv_key(".leading.and.trailing."), "leading.and.trailing");
    }
}
