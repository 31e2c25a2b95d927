use crate::domain::{
    DomainError, DomainResult, RetentionRepository, RetentionRow, RetentionTable, RowKey,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

/// PostgreSQL implementation of RetentionRepository trait.
///
/// `telemetry_samples` ages by sensed `ts` (epoch ms); `ops_metrics` by
/// `created_at`.
#[derive(Clone)]
pub struct PostgresRetentionRepository {
    client: PostgresClient,
}

impl PostgresRetentionRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RetentionRepository for PostgresRetentionRepository {
    #[instrument(skip(self), fields(table = table.name()))]
    async fn fetch_oldest(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<RetentionRow>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match table {
            RetentionTable::TelemetrySamples => conn
                .query(
                    "SELECT device_id, ts, to_jsonb(t) FROM telemetry_samples t
                     WHERE ts < $1
                     ORDER BY ts, device_id
                     LIMIT $2",
                    &[&cutoff.timestamp_millis(), &limit],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?
                .iter()
                .map(|row| RetentionRow {
                    key: RowKey::Sample {
                        device_id: row.get(0),
                        ts: row.get(1),
                    },
                    record: row.get::<_, Value>(2),
                })
                .collect::<Vec<_>>(),
            RetentionTable::OpsMetrics => conn
                .query(
                    "SELECT id, to_jsonb(t) FROM ops_metrics t
                     WHERE created_at < $1
                     ORDER BY created_at, id
                     LIMIT $2",
                    &[&cutoff, &limit],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?
                .iter()
                .map(|row| RetentionRow {
                    key: RowKey::OpsMetric { id: row.get(0) },
                    record: row.get::<_, Value>(1),
                })
                .collect::<Vec<_>>(),
        };

        debug!("fetched {} rows older than cutoff", rows.len());
        Ok(rows)
    }

    #[instrument(skip(self), fields(table = table.name()))]
    async fn count_older_than(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
    ) -> DomainResult<u64> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = match table {
            RetentionTable::TelemetrySamples => {
                conn.query_one(
                    "SELECT count(*) FROM telemetry_samples WHERE ts < $1",
                    &[&cutoff.timestamp_millis()],
                )
                .await
            }
            RetentionTable::OpsMetrics => {
                conn.query_one(
                    "SELECT count(*) FROM ops_metrics WHERE created_at < $1",
                    &[&cutoff],
                )
                .await
            }
        }
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, keys), fields(table = table.name(), count = keys.len()))]
    async fn delete_rows(&self, table: RetentionTable, keys: &[RowKey]) -> DomainResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let deleted = match table {
            RetentionTable::TelemetrySamples => {
                let mut device_ids = Vec::with_capacity(keys.len());
                let mut timestamps = Vec::with_capacity(keys.len());
                for key in keys {
                    match key {
                        RowKey::Sample { device_id, ts } => {
                            device_ids.push(device_id.clone());
                            timestamps.push(*ts);
                        }
                        RowKey::OpsMetric { .. } => return Err(mismatched_key(table)),
                    }
                }
                conn.execute(
                    "DELETE FROM telemetry_samples
                     WHERE (device_id, ts) IN (SELECT * FROM unnest($1::text[], $2::bigint[]))",
                    &[&device_ids, &timestamps],
                )
                .await
            }
            RetentionTable::OpsMetrics => {
                let mut ids = Vec::with_capacity(keys.len());
                for key in keys {
                    match key {
                        RowKey::OpsMetric { id } => ids.push(*id),
                        RowKey::Sample { .. } => return Err(mismatched_key(table)),
                    }
                }
                conn.execute("DELETE FROM ops_metrics WHERE id = ANY($1)", &[&ids])
                    .await
            }
        }
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("deleted {} rows", deleted);
        Ok(deleted)
    }
}

fn mismatched_key(table: RetentionTable) -> DomainError {
    DomainError::ValidationError(format!("row key does not belong to table {}", table.name()))
}
