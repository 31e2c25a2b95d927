use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One operational measurement of a device-facing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsMetric {
    pub route: String,
    pub status: u16,
    pub duration_ms: u64,
    pub device_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Sink for operational metrics.
///
/// Recording is a secondary step: callers log failures and continue, a
/// recorder error never fails the request it describes.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OpsMetricsRecorder: Send + Sync {
    async fn record(&self, metric: OpsMetric) -> DomainResult<()>;
}
