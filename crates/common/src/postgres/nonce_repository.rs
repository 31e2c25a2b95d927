use crate::domain::{DomainError, DomainResult, NonceRepository};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

// Inserts a new nonce, or revives an expired one. An unexpired conflict
// leaves the row untouched and returns nothing.
const RECORD_NONCE: &str = "INSERT INTO ingest_nonces (nonce, expires_at)
     VALUES ($1, $2)
     ON CONFLICT (nonce) DO UPDATE SET expires_at = EXCLUDED.expires_at
     WHERE ingest_nonces.expires_at <= $3
     RETURNING nonce";

/// PostgreSQL implementation of NonceRepository trait
#[derive(Clone)]
pub struct PostgresNonceRepository {
    client: PostgresClient,
}

impl PostgresNonceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NonceRepository for PostgresNonceRepository {
    #[instrument(skip(self, nonce))]
    async fn record_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(RECORD_NONCE, &[&nonce, &expires_at, &now])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn prune_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let deleted = conn
            .execute("DELETE FROM ingest_nonces WHERE expires_at <= $1", &[&now])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("pruned {} expired nonces", deleted);
        Ok(deleted)
    }
}
