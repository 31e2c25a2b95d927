use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Replay-protection ledger for signed device requests
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NonceRepository: Send + Sync {
    /// Atomically record `nonce` unless an unexpired record already exists.
    ///
    /// Returns `true` when the nonce was recorded (first use, or the previous
    /// record had expired) and `false` when it is a replay.
    async fn record_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool>;

    /// Delete every nonce that expired at or before `now`, returning the count
    async fn prune_expired(&self, now: DateTime<Utc>) -> DomainResult<u64>;
}
