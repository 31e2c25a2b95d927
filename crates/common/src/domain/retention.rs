use crate::domain::result::DomainResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Tables purged by the retention job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionTable {
    TelemetrySamples,
    OpsMetrics,
}

impl RetentionTable {
    /// Processing order; the job cursor indexes into this
    pub const ALL: [RetentionTable; 2] = [RetentionTable::TelemetrySamples, RetentionTable::OpsMetrics];

    pub fn name(&self) -> &'static str {
        match self {
            RetentionTable::TelemetrySamples => "telemetry_samples",
            RetentionTable::OpsMetrics => "ops_metrics",
        }
    }
}

/// Primary key of a row selected for purge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Sample { device_id: String, ts: i64 },
    OpsMetric { id: i64 },
}

/// A row selected for purge, with its full JSON representation for archival
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionRow {
    pub key: RowKey,
    pub record: Value,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RetentionRepository: Send + Sync {
    /// Oldest `limit` rows strictly older than `cutoff`, oldest first
    async fn fetch_oldest(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<RetentionRow>>;

    async fn count_older_than(&self, table: RetentionTable, cutoff: DateTime<Utc>) -> DomainResult<u64>;

    /// Delete exactly the given rows, returning the number removed
    async fn delete_rows(&self, table: RetentionTable, keys: &[RowKey]) -> DomainResult<u64>;
}

/// Metadata attached to each archived batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTags {
    pub cutoff: DateTime<Utc>,
    pub job_id: String,
}

/// Immutable object storage for retention archives
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Write one object. Returns only once the object is durably stored.
    async fn put_batch(&self, key: &str, body: Bytes, tags: &ArchiveTags) -> DomainResult<()>;
}

/// Durable progress marker for a multi-invocation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCursor {
    /// Index into [`RetentionTable::ALL`] of the next table to process
    pub next_table: u32,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JobCursorStore: Send + Sync {
    async fn load(&self, job_name: &str) -> DomainResult<Option<JobCursor>>;

    async fn save(&self, job_name: &str, cursor: JobCursor) -> DomainResult<()>;
}
