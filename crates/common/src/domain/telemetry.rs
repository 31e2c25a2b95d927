use crate::domain::derived_metrics::DerivedMetrics;
use crate::domain::device::DeviceRegistration;
use crate::domain::result::DomainResult;
use crate::domain::series::{DeviceBucketStats, SeriesQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Immutable telemetry fact keyed by `(device_id, ts)`
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    /// Sensed time, epoch milliseconds
    pub ts: i64,
    pub metrics: Map<String, Value>,
    pub derived: DerivedMetrics,
    pub status: Option<Value>,
    pub faults: Vec<String>,
    pub rssi: Option<i32>,
    pub received_at: DateTime<Utc>,
}

/// Most recent snapshot for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestState {
    /// Never serialized; responses carry the caller-appropriate identifier
    #[serde(skip_serializing)]
    pub device_id: String,
    pub ts: Option<i64>,
    pub metrics: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub derived: DerivedMetrics,
    pub status: Option<Value>,
    pub faults: Vec<String>,
    pub rssi: Option<i32>,
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

/// Which sample wins the latest-state row when deliveries arrive out of order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LatestStateOrdering {
    /// Most recently received sample wins, regardless of its `ts`
    #[default]
    Received,
    /// Sample with the greatest `ts` wins
    Sensed,
}

impl LatestStateOrdering {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "received" => Some(LatestStateOrdering::Received),
            "sensed" => Some(LatestStateOrdering::Sensed),
            _ => None,
        }
    }
}

/// Input for the atomic sample + latest-state + device write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSampleInput {
    pub device: DeviceRegistration,
    pub sample: TelemetrySample,
}

/// Result of a sample write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSampleOutcome {
    /// False when `(device_id, ts)` already existed and the insert was a no-op
    pub inserted: bool,
}

/// Input for the reduced heartbeat write
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatInput {
    pub device: DeviceRegistration,
    pub ts: i64,
    pub received_at: DateTime<Utc>,
}

/// Repository trait for telemetry persistence and reads
/// Infrastructure layer (e.g., common::postgres) implements this trait
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    /// Insert the sample (no-op on duplicate key), upsert latest state and
    /// upsert the device as online, all in one transaction
    async fn write_sample(&self, input: WriteSampleInput) -> DomainResult<WriteSampleOutcome>;

    /// Upsert the device as online and flag its latest state online
    async fn write_heartbeat(&self, input: HeartbeatInput) -> DomainResult<()>;

    /// Fetch latest-state rows for the given devices; devices without a row
    /// are omitted
    async fn get_latest_states(&self, device_ids: &[String]) -> DomainResult<Vec<LatestState>>;

    /// Per-device, per-bucket statistics for a series query
    async fn get_device_bucket_stats(
        &self,
        query: &SeriesQuery,
    ) -> DomainResult<Vec<DeviceBucketStats>>;
}
