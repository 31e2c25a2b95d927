use crate::domain::{DomainError, DomainResult, JobCursor, JobCursorStore};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

/// PostgreSQL implementation of JobCursorStore trait
#[derive(Clone)]
pub struct PostgresJobCursorStore {
    client: PostgresClient,
}

impl PostgresJobCursorStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobCursorStore for PostgresJobCursorStore {
    #[instrument(skip(self))]
    async fn load(&self, job_name: &str) -> DomainResult<Option<JobCursor>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT next_table FROM job_cursors WHERE job_name = $1",
                &[&job_name],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.map(|row| {
            let next_table: i32 = row.get(0);
            JobCursor {
                next_table: next_table.max(0) as u32,
            }
        }))
    }

    #[instrument(skip(self), fields(next_table = cursor.next_table))]
    async fn save(&self, job_name: &str, cursor: JobCursor) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let next_table = i32::try_from(cursor.next_table)
            .map_err(|_| DomainError::ValidationError("next_table: out of range".to_string()))?;

        conn.execute(
            "INSERT INTO job_cursors (job_name, next_table, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (job_name) DO UPDATE SET
                next_table = EXCLUDED.next_table,
                updated_at = EXCLUDED.updated_at",
            &[&job_name, &next_table, &Utc::now()],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("saved job cursor");
        Ok(())
    }
}
