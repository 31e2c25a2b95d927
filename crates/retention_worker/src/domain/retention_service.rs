//! Backup-before-delete retention job.
//!
//! Each invocation walks [`RetentionTable::ALL`] starting from the durable
//! cursor. Per table it repeatedly fetches the oldest batch past the cutoff,
//! archives it as one NDJSON object (when a destination is configured) and
//! only then deletes exactly those rows. A crash between archive and delete
//! leaves the rows in place, so the next run archives them again under a new
//! job id: archival is at-least-once, deletion never precedes backup.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use common::domain::{
    ArchiveStore, ArchiveTags, DomainError, DomainResult, JobCursor, JobCursorStore,
    RetentionRepository, RetentionRow, RetentionTable, RowKey,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub const MIN_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const RETENTION_JOB_NAME: &str = "telemetry-retention";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Rows older than this many days are purged; raised to
    /// [`MIN_RETENTION_DAYS`] if set lower
    pub retention_days: u32,
    /// Refuse to run without an archive destination
    pub backup_required: bool,
    /// Object key prefix inside the archive bucket
    pub archive_prefix: String,
    pub batch_size: usize,
    /// Rows per delete statement
    pub delete_chunk_size: usize,
    pub dry_run: bool,
    /// Batches processed per invocation across all tables; 0 is unlimited
    pub max_batches_per_run: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            backup_required: true,
            archive_prefix: "retention".to_string(),
            batch_size: 250,
            delete_chunk_size: 50,
            dry_run: false,
            max_batches_per_run: 0,
        }
    }
}

impl RetentionConfig {
    pub fn effective_retention_days(&self) -> u32 {
        self.retention_days.max(MIN_RETENTION_DAYS)
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.effective_retention_days()))
    }
}

/// Job state transitions, logged as they happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPhase {
    Started,
    Scanning,
    BackingUp,
    Deleting,
    Advancing,
    Completed,
    BackupRequiredButMissing,
}

impl RetentionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPhase::Started => "started",
            RetentionPhase::Scanning => "scanning",
            RetentionPhase::BackingUp => "backing_up",
            RetentionPhase::Deleting => "deleting",
            RetentionPhase::Advancing => "advancing",
            RetentionPhase::Completed => "completed",
            RetentionPhase::BackupRequiredButMissing => "backup_required_but_missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: RetentionTable,
    pub scanned: u64,
    pub archived: u64,
    pub deleted: u64,
    pub batches: u64,
    /// False when the batch budget ran out before the table was drained
    pub complete: bool,
}

impl TableReport {
    fn new(table: RetentionTable) -> Self {
        Self {
            table,
            scanned: 0,
            archived: 0,
            deleted: 0,
            batches: 0,
            complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub job_id: String,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub tables: Vec<TableReport>,
    /// True when every table was drained; otherwise the cursor holds the
    /// table to resume from
    pub completed: bool,
}

/// `{prefix}/{job_id}/{table}/batch-{n}.ndjson`
pub fn archive_key(prefix: &str, job_id: &str, table: RetentionTable, batch: u64) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}/batch-{}.ndjson", job_id, table.name(), batch)
    } else {
        format!("{}/{}/{}/batch-{}.ndjson", prefix, job_id, table.name(), batch)
    }
}

/// One JSON document per line, newline terminated
pub fn to_ndjson(rows: &[RetentionRow]) -> DomainResult<Bytes> {
    let mut body = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut body, &row.record)
            .map_err(|e| DomainError::ArchiveError(format!("failed to serialize row: {}", e)))?;
        body.push(b'\n');
    }
    Ok(Bytes::from(body))
}

fn log_phase(job_id: &str, phase: RetentionPhase, table: Option<RetentionTable>) {
    debug!(
        job_id = %job_id,
        phase = phase.as_str(),
        table = table.map(|t| t.name()).unwrap_or("-"),
        "retention phase"
    );
}

pub struct RetentionService {
    retention_repository: Arc<dyn RetentionRepository>,
    archive_store: Option<Arc<dyn ArchiveStore>>,
    cursor_store: Arc<dyn JobCursorStore>,
    config: RetentionConfig,
}

impl RetentionService {
    pub fn new(
        retention_repository: Arc<dyn RetentionRepository>,
        archive_store: Option<Arc<dyn ArchiveStore>>,
        cursor_store: Arc<dyn JobCursorStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            retention_repository,
            archive_store,
            cursor_store,
            config,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Run one invocation of the job. Mints a fresh job id.
    #[instrument(skip(self), fields(dry_run = self.config.dry_run, backup_required = self.config.backup_required))]
    pub async fn run(&self, now: DateTime<Utc>) -> DomainResult<RetentionReport> {
        let job_id = xid::new().to_string();
        let cutoff = self.config.cutoff(now);
        log_phase(&job_id, RetentionPhase::Started, None);

        if self.config.backup_required && self.archive_store.is_none() && !self.config.dry_run {
            log_phase(&job_id, RetentionPhase::BackupRequiredButMissing, None);
            error!(job_id = %job_id, "backup required but no archive destination configured");
            return Err(DomainError::BackupDestinationMissing);
        }

        info!(
            job_id = %job_id,
            cutoff = %cutoff.to_rfc3339(),
            retention_days = self.config.effective_retention_days(),
            "retention job started"
        );

        let report = if self.config.dry_run {
            self.dry_run(job_id, cutoff).await?
        } else {
            self.purge(job_id, cutoff).await?
        };

        for table in &report.tables {
            info!(
                job_id = %report.job_id,
                table = table.table.name(),
                scanned = table.scanned,
                archived = table.archived,
                deleted = table.deleted,
                batches = table.batches,
                dry_run = report.dry_run,
                "retention table summary"
            );
        }

        if report.completed {
            log_phase(&report.job_id, RetentionPhase::Completed, None);
        }

        Ok(report)
    }

    async fn dry_run(&self, job_id: String, cutoff: DateTime<Utc>) -> DomainResult<RetentionReport> {
        let batch_size = self.config.batch_size.max(1) as u64;
        let mut tables = Vec::with_capacity(RetentionTable::ALL.len());

        for table in RetentionTable::ALL {
            log_phase(&job_id, RetentionPhase::Scanning, Some(table));
            let count = self
                .retention_repository
                .count_older_than(table, cutoff)
                .await?;
            tables.push(TableReport {
                table,
                scanned: count,
                archived: 0,
                deleted: 0,
                batches: count.div_ceil(batch_size),
                complete: true,
            });
        }

        Ok(RetentionReport {
            job_id,
            cutoff,
            dry_run: true,
            tables,
            completed: true,
        })
    }

    async fn purge(&self, job_id: String, cutoff: DateTime<Utc>) -> DomainResult<RetentionReport> {
        let table_count = RetentionTable::ALL.len();
        let mut start = self
            .cursor_store
            .load(RETENTION_JOB_NAME)
            .await?
            .unwrap_or_default()
            .next_table as usize;
        if start >= table_count {
            start = 0;
        }
        if start > 0 {
            debug!(job_id = %job_id, next_table = start, "resuming from cursor");
        }

        let mut budget = match self.config.max_batches_per_run {
            0 => usize::MAX,
            n => n,
        };
        let tags = ArchiveTags {
            cutoff,
            job_id: job_id.clone(),
        };
        let mut report = RetentionReport {
            job_id,
            cutoff,
            dry_run: false,
            tables: Vec::new(),
            completed: false,
        };

        for (index, table) in RetentionTable::ALL.into_iter().enumerate().skip(start) {
            if budget == 0 {
                // The cursor already points at this table
                info!(
                    job_id = %report.job_id,
                    table = table.name(),
                    "batch budget exhausted, will resume on next run"
                );
                return Ok(report);
            }

            let table_report = self.purge_table(table, &tags, &mut budget).await?;
            let complete = table_report.complete;
            report.tables.push(table_report);

            if !complete {
                self.save_cursor(index).await?;
                info!(
                    job_id = %report.job_id,
                    table = table.name(),
                    "batch budget exhausted, will resume on next run"
                );
                return Ok(report);
            }

            log_phase(&report.job_id, RetentionPhase::Advancing, Some(table));
            self.save_cursor((index + 1) % table_count).await?;
        }

        report.completed = true;
        Ok(report)
    }

    async fn purge_table(
        &self,
        table: RetentionTable,
        tags: &ArchiveTags,
        budget: &mut usize,
    ) -> DomainResult<TableReport> {
        let mut report = TableReport::new(table);
        let batch_size = self.config.batch_size.max(1);
        let chunk_size = self.config.delete_chunk_size.max(1);

        loop {
            if *budget == 0 {
                return Ok(report);
            }

            log_phase(&tags.job_id, RetentionPhase::Scanning, Some(table));
            let rows = self
                .retention_repository
                .fetch_oldest(table, tags.cutoff, batch_size)
                .await?;
            if rows.is_empty() {
                report.complete = true;
                return Ok(report);
            }
            let fetched = rows.len();
            report.scanned += fetched as u64;
            let batch_number = report.batches + 1;

            if let Some(archive_store) = &self.archive_store {
                log_phase(&tags.job_id, RetentionPhase::BackingUp, Some(table));
                let key = archive_key(&self.config.archive_prefix, &tags.job_id, table, batch_number);
                let body = to_ndjson(&rows)?;
                archive_store.put_batch(&key, body, tags).await?;
                report.archived += rows.len() as u64;
                debug!(key = %key, rows = rows.len(), "batch archived");
            }

            log_phase(&tags.job_id, RetentionPhase::Deleting, Some(table));
            let keys: Vec<RowKey> = rows.into_iter().map(|row| row.key).collect();
            let mut deleted = 0;
            for chunk in keys.chunks(chunk_size) {
                deleted += self.retention_repository.delete_rows(table, chunk).await?;
            }

            if deleted < keys.len() as u64 {
                warn!(
                    table = table.name(),
                    expected = keys.len(),
                    deleted,
                    "fewer rows deleted than archived"
                );
            }
            if deleted == 0 {
                // The same rows would be fetched again
                return Err(DomainError::RepositoryError(anyhow::anyhow!(
                    "retention delete removed no rows from {}",
                    table.name()
                )));
            }

            report.deleted += deleted;
            report.batches = batch_number;
            *budget -= 1;

            if fetched < batch_size {
                report.complete = true;
                return Ok(report);
            }
        }
    }

    async fn save_cursor(&self, next_table: usize) -> DomainResult<()> {
        self.cursor_store
            .save(
                RETENTION_JOB_NAME,
                JobCursor {
                    next_table: next_table as u32,
                },
            )
            .await
    }
}
