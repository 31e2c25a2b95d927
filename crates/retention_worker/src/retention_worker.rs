use crate::domain::{RetentionReport, RetentionService};
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Scheduled driver for [`RetentionService`]
///
/// The runner's interval process skips a tick while the previous run is still
/// in flight, so invocations never overlap within one process.
pub struct RetentionWorker {
    service: Arc<RetentionService>,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(service: Arc<RetentionService>, interval: Duration) -> Self {
        info!(interval_secs = interval.as_secs(), "initializing retention worker");
        Self { service, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the job once now
    pub async fn run_once(&self) -> anyhow::Result<RetentionReport> {
        run_retention(&self.service).await
    }

    /// Task for `Runner::with_interval_process`
    pub fn into_interval_task(
        self,
    ) -> impl Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync + 'static
    {
        let service = self.service;
        move || {
            let service = service.clone();
            Box::pin(async move {
                run_retention(&service).await?;
                Ok(())
            })
        }
    }
}

async fn run_retention(service: &RetentionService) -> anyhow::Result<RetentionReport> {
    match service.run(Utc::now()).await {
        Ok(report) => {
            let deleted: u64 = report.tables.iter().map(|t| t.deleted).sum();
            info!(
                job_id = %report.job_id,
                deleted,
                completed = report.completed,
                dry_run = report.dry_run,
                "retention run finished"
            );
            Ok(report)
        }
        Err(e) => {
            warn!(error = %e, "retention run failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetentionConfig;
    use common::domain::{MockJobCursorStore, MockRetentionRepository};

    #[tokio::test]
    async fn test_interval_task_surfaces_job_failure() {
        let service = RetentionService::new(
            Arc::new(MockRetentionRepository::new()),
            None,
            Arc::new(MockJobCursorStore::new()),
            RetentionConfig::default(),
        );
        let worker = RetentionWorker::new(Arc::new(service), Duration::from_secs(3600));
        assert_eq!(worker.interval(), Duration::from_secs(3600));

        let task = worker.into_interval_task();
        let result = task().await;

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("archive destination"));
    }

    #[tokio::test]
    async fn test_run_once_dry_run() {
        let mut repository = MockRetentionRepository::new();
        repository
            .expect_count_older_than()
            .times(2)
            .returning(|_, _| Ok(0));

        let service = RetentionService::new(
            Arc::new(repository),
            None,
            Arc::new(MockJobCursorStore::new()),
            RetentionConfig {
                dry_run: true,
                ..RetentionConfig::default()
            },
        );
        let worker = RetentionWorker::new(Arc::new(service), Duration::from_secs(60));

        let report = worker.run_once().await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.tables.len(), 2);
    }
}
