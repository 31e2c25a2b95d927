//! Time-bucketed series aggregation.
//!
//! Aggregation is two-level: storage produces per-device, per-bucket
//! statistics and [`aggregate_device_buckets`] folds those across devices so
//! that each device-bucket carries equal weight regardless of how many raw
//! samples it contributed.

use crate::domain::result::{DomainError, DomainResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// Metrics a series query may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SeriesMetric {
    SupplyC,
    ReturnC,
    TankC,
    AmbientC,
    FlowLps,
    CompCurrentA,
    EevSteps,
    PowerKw,
    DeltaT,
    ThermalKw,
    Cop,
}

impl SeriesMetric {
    pub const ALL: [SeriesMetric; 11] = [
        SeriesMetric::SupplyC,
        SeriesMetric::ReturnC,
        SeriesMetric::TankC,
        SeriesMetric::AmbientC,
        SeriesMetric::FlowLps,
        SeriesMetric::CompCurrentA,
        SeriesMetric::EevSteps,
        SeriesMetric::PowerKw,
        SeriesMetric::DeltaT,
        SeriesMetric::ThermalKw,
        SeriesMetric::Cop,
    ];

    /// Name used on the wire and as the key inside the raw `metrics` object
    pub fn name(&self) -> &'static str {
        match self {
            SeriesMetric::SupplyC => "supplyC",
            SeriesMetric::ReturnC => "returnC",
            SeriesMetric::TankC => "tankC",
            SeriesMetric::AmbientC => "ambientC",
            SeriesMetric::FlowLps => "flowLps",
            SeriesMetric::CompCurrentA => "compCurrentA",
            SeriesMetric::EevSteps => "eevSteps",
            SeriesMetric::PowerKw => "powerKW",
            SeriesMetric::DeltaT => "deltaT",
            SeriesMetric::ThermalKw => "thermalKW",
            SeriesMetric::Cop => "cop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        SeriesMetric::ALL.into_iter().find(|m| m.name() == value)
    }

    /// True for metrics computed at ingest and stored in their own column
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            SeriesMetric::DeltaT | SeriesMetric::ThermalKw | SeriesMetric::Cop
        )
    }
}

/// Parse a comma-separated metric list, rejecting unknown names
pub fn parse_metrics(value: &str) -> DomainResult<Vec<SeriesMetric>> {
    let mut metrics = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let metric = SeriesMetric::parse(name)
            .ok_or_else(|| DomainError::ValidationError(format!("metric: unknown metric '{}'", name)))?;
        if !metrics.contains(&metric) {
            metrics.push(metric);
        }
    }
    if metrics.is_empty() {
        return Err(DomainError::ValidationError(
            "metric: at least one metric is required".to_string(),
        ));
    }
    Ok(metrics)
}

pub const MIN_INTERVAL_MS: i64 = 60_000;
pub const MAX_INTERVAL_MS: i64 = 86_400_000;
pub const MAX_SERIES_BUCKETS: i64 = 5_000;

/// Parse a bucket width such as `30s`, `5m`, `1h` or `1d` into milliseconds
pub fn parse_interval(value: &str) -> DomainResult<i64> {
    let invalid = || DomainError::ValidationError(format!("interval: invalid interval '{}'", value));

    let value = value.trim();
    if value.len() < 2 {
        return Err(invalid());
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid()),
    };
    let interval_ms = amount.checked_mul(unit_ms).ok_or_else(invalid)?;

    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        return Err(DomainError::ValidationError(format!(
            "interval: must be between 1m and 1d, got '{}'",
            value
        )));
    }
    Ok(interval_ms)
}

/// Which devices a series query covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    All,
    Devices(Vec<String>),
    Profiles(Vec<String>),
}

/// Storage-level series query
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub filter: DeviceFilter,
    pub metrics: Vec<SeriesMetric>,
    /// Inclusive, epoch milliseconds
    pub start_ms: i64,
    /// Exclusive, epoch milliseconds
    pub end_ms: i64,
    pub interval_ms: i64,
}

impl SeriesQuery {
    pub fn validate_window(&self) -> DomainResult<()> {
        if self.end_ms <= self.start_ms {
            return Err(DomainError::ValidationError(
                "end: must be after start".to_string(),
            ));
        }
        let buckets = (self.end_ms - self.start_ms + self.interval_ms - 1) / self.interval_ms;
        if buckets > MAX_SERIES_BUCKETS {
            return Err(DomainError::ValidationError(format!(
                "interval: window spans {} buckets, maximum is {}",
                buckets, MAX_SERIES_BUCKETS
            )));
        }
        Ok(())
    }
}

/// Floor a timestamp to the start of its bucket
pub fn bucket_start(ts_ms: i64, interval_ms: i64) -> i64 {
    ts_ms.div_euclid(interval_ms) * interval_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// First-level aggregate: one device within one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBucketStats {
    pub device_id: String,
    pub bucket_start: i64,
    pub sample_count: u64,
    pub values: BTreeMap<SeriesMetric, MetricStats>,
}

/// Second-level aggregate returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesBucket {
    pub bucket_start: i64,
    pub sample_count: u64,
    pub values: BTreeMap<String, MetricStats>,
}

#[derive(Default)]
struct MetricFold {
    avg_sum: f64,
    devices: u32,
    min: f64,
    max: f64,
}

impl MetricFold {
    fn add(&mut self, stats: &MetricStats) {
        if self.devices == 0 {
            self.min = stats.min;
            self.max = stats.max;
        } else {
            self.min = self.min.min(stats.min);
            self.max = self.max.max(stats.max);
        }
        self.avg_sum += stats.avg;
        self.devices += 1;
    }

    fn finish(&self) -> MetricStats {
        MetricStats {
            avg: self.avg_sum / f64::from(self.devices),
            min: self.min,
            max: self.max,
        }
    }
}

/// Fold per-device bucket statistics into fleet-level buckets.
///
/// Per bucket: `sample_count` is the raw sample total, `avg` is the mean of
/// device averages, `min`/`max` are the extremes across devices. Buckets
/// where no sample carries a requested metric are omitted; output is ordered
/// by `bucket_start`.
pub fn aggregate_device_buckets(stats: Vec<DeviceBucketStats>) -> Vec<SeriesBucket> {
    let mut buckets: BTreeMap<i64, (u64, BTreeMap<SeriesMetric, MetricFold>)> = BTreeMap::new();

    for device_bucket in stats {
        if device_bucket.sample_count == 0 {
            continue;
        }
        let (count, folds) = buckets.entry(device_bucket.bucket_start).or_default();
        *count += device_bucket.sample_count;
        for (metric, metric_stats) in &device_bucket.values {
            folds.entry(*metric).or_default().add(metric_stats);
        }
    }

    buckets
        .into_iter()
        .filter(|(_, (_, folds))| !folds.is_empty())
        .map(|(bucket_start, (sample_count, folds))| SeriesBucket {
            bucket_start,
            sample_count,
            values: folds
                .iter()
                .map(|(metric, fold)| (metric.name().to_string(), fold.finish()))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_bucket(
        device_id: &str,
        bucket_start: i64,
        raw: &[f64],
    ) -> DeviceBucketStats {
        let sum: f64 = raw.iter().sum();
        let mut values = BTreeMap::new();
        values.insert(
            SeriesMetric::DeltaT,
            MetricStats {
                avg: sum / raw.len() as f64,
                min: raw.iter().cloned().fold(f64::INFINITY, f64::min),
                max: raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            },
        );
        DeviceBucketStats {
            device_id: device_id.to_string(),
            bucket_start,
            sample_count: raw.len() as u64,
            values,
        }
    }

    #[test]
    fn test_fleet_average_weights_devices_not_samples() {
        // Device A: one sample (2). Device B: three samples (8, 10, 12).
        // Raw mean = 32 / 4 = 8.0; mean of device means = (2 + 10) / 2 = 6.0.
        let result = aggregate_device_buckets(vec![
            device_bucket("hp-a", 0, &[2.0]),
            device_bucket("hp-b", 0, &[8.0, 10.0, 12.0]),
        ]);

        assert_eq!(result.len(), 1);
        let bucket = &result[0];
        assert_eq!(bucket.sample_count, 4);
        let delta_t = bucket.values["deltaT"];
        assert_eq!(delta_t.avg, 6.0);
        assert_ne!(delta_t.avg, 8.0);
        assert_eq!(delta_t.min, 2.0);
        assert_eq!(delta_t.max, 12.0);
    }

    #[test]
    fn test_buckets_are_ordered_and_empty_ones_omitted() {
        let result = aggregate_device_buckets(vec![
            device_bucket("hp-a", 600_000, &[4.0]),
            device_bucket("hp-a", 0, &[2.0]),
            DeviceBucketStats {
                device_id: "hp-b".to_string(),
                bucket_start: 300_000,
                sample_count: 0,
                values: BTreeMap::new(),
            },
        ]);

        let starts: Vec<i64> = result.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![0, 600_000]);
    }

    #[test]
    fn test_metric_missing_on_some_devices() {
        let mut without_metric = device_bucket("hp-b", 0, &[1.0]);
        without_metric.values.clear();

        let result = aggregate_device_buckets(vec![device_bucket("hp-a", 0, &[3.0]), without_metric]);

        assert_eq!(result[0].sample_count, 2);
        assert_eq!(result[0].values["deltaT"].avg, 3.0);
    }

    #[test]
    fn test_bucket_without_requested_metrics_is_omitted() {
        let mut no_metrics = device_bucket("hp-a", 300_000, &[5.0, 6.0]);
        no_metrics.values.clear();

        let result = aggregate_device_buckets(vec![device_bucket("hp-a", 0, &[2.0]), no_metrics]);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].bucket_start, 0);
        assert_eq!(result[0].sample_count, 1);
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("5m").unwrap(), 300_000);
        assert_eq!(parse_interval("1h").unwrap(), 3_600_000);
        assert_eq!(parse_interval("1d").unwrap(), 86_400_000);
        assert_eq!(parse_interval("90s").unwrap(), 90_000);
        assert!(matches!(parse_interval("30s"), Err(DomainError::ValidationError(_))));
        assert!(matches!(parse_interval("2d"), Err(DomainError::ValidationError(_))));
        assert!(matches!(parse_interval("m"), Err(DomainError::ValidationError(_))));
        assert!(matches!(parse_interval("-5m"), Err(DomainError::ValidationError(_))));
        assert!(matches!(parse_interval("5w"), Err(DomainError::ValidationError(_))));
    }

    #[test]
    fn test_parse_metrics() {
        let metrics = parse_metrics("deltaT, cop,deltaT").unwrap();
        assert_eq!(metrics, vec![SeriesMetric::DeltaT, SeriesMetric::Cop]);
        assert!(matches!(parse_metrics("deltaT,bogus"), Err(DomainError::ValidationError(_))));
        assert!(matches!(parse_metrics(""), Err(DomainError::ValidationError(_))));
    }

    #[test]
    fn test_window_validation() {
        let query = SeriesQuery {
            filter: DeviceFilter::All,
            metrics: vec![SeriesMetric::Cop],
            start_ms: 0,
            end_ms: 60_000 * 5_001,
            interval_ms: 60_000,
        };
        assert!(query.validate_window().is_err());

        let query = SeriesQuery {
            end_ms: 60_000 * 5_000,
            ..query
        };
        assert!(query.validate_window().is_ok());

        let query = SeriesQuery { end_ms: 0, ..query };
        assert!(query.validate_window().is_err());
    }

    #[test]
    fn test_bucket_start_floors() {
        assert_eq!(bucket_start(299_999, 300_000), 0);
        assert_eq!(bucket_start(300_000, 300_000), 300_000);
        assert_eq!(bucket_start(-1, 300_000), -300_000);
    }
}
