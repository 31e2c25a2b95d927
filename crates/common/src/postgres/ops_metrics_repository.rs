use crate::domain::{DomainError, DomainResult, OpsMetric, OpsMetricsRecorder};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use tracing::instrument;

/// Stores operational metrics in the `ops_metrics` table
#[derive(Clone)]
pub struct PostgresOpsMetricsRecorder {
    client: PostgresClient,
}

impl PostgresOpsMetricsRecorder {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OpsMetricsRecorder for PostgresOpsMetricsRecorder {
    #[instrument(skip(self, metric), fields(route = %metric.route, status = metric.status))]
    async fn record(&self, metric: OpsMetric) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let status = i32::from(metric.status);
        let duration_ms = i64::try_from(metric.duration_ms).unwrap_or(i64::MAX);

        conn.execute(
            "INSERT INTO ops_metrics (route, status, duration_ms, device_id, created_at)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &metric.route,
                &status,
                &duration_ms,
                &metric.device_id,
                &metric.recorded_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }
}
