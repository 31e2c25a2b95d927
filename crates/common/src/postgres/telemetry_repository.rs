use crate::domain::{
    CopQuality, DerivedMetrics, DeviceBucketStats, DeviceFilter, DomainError, DomainResult,
    HeartbeatInput, LatestState, LatestStateOrdering, MetricStats, SeriesMetric, SeriesQuery,
    TelemetryRepository, WriteSampleInput, WriteSampleOutcome,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const INSERT_SAMPLE: &str = "INSERT INTO telemetry_samples
        (device_id, ts, metrics, delta_t, thermal_kw, cop, cop_quality, status, faults, rssi, received_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
     ON CONFLICT (device_id, ts) DO NOTHING";

const UPSERT_LATEST: &str = "INSERT INTO latest_state
        (device_id, ts, metrics, delta_t, thermal_kw, cop, cop_quality, status, faults, rssi, online, updated_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11)
     ON CONFLICT (device_id) DO UPDATE SET
        ts = EXCLUDED.ts,
        metrics = EXCLUDED.metrics,
        delta_t = EXCLUDED.delta_t,
        thermal_kw = EXCLUDED.thermal_kw,
        cop = EXCLUDED.cop,
        cop_quality = EXCLUDED.cop_quality,
        status = EXCLUDED.status,
        faults = EXCLUDED.faults,
        rssi = EXCLUDED.rssi,
        online = TRUE,
        updated_at = EXCLUDED.updated_at";

// A heartbeat-only row has a NULL ts and is always replaced
const SENSED_ORDER_GUARD: &str =
    " WHERE latest_state.ts IS NULL OR latest_state.ts <= EXCLUDED.ts";

const UPSERT_DEVICE_ONLINE: &str = "INSERT INTO devices
        (device_id, profile_id, device_key_hash, online, last_seen_at)
     VALUES ($1, $2, $3, TRUE, $4)
     ON CONFLICT (device_id) DO UPDATE SET
        online = TRUE,
        last_seen_at = EXCLUDED.last_seen_at";

const UPSERT_LATEST_ONLINE: &str = "INSERT INTO latest_state (device_id, online, updated_at)
     VALUES ($1, TRUE, $2)
     ON CONFLICT (device_id) DO UPDATE SET
        online = TRUE,
        updated_at = EXCLUDED.updated_at";

const LATEST_COLUMNS: &str = "device_id, ts, metrics, delta_t, thermal_kw, cop, cop_quality, \
     status, faults, rssi, online, updated_at";

/// SQL expression yielding a metric as float8, or NULL when absent or non-numeric
fn metric_expression(metric: SeriesMetric) -> String {
    match metric {
        SeriesMetric::DeltaT => "delta_t".to_string(),
        SeriesMetric::ThermalKw => "thermal_kw".to_string(),
        SeriesMetric::Cop => "cop".to_string(),
        raw => format!(
            "CASE WHEN jsonb_typeof(metrics->'{name}') = 'number' THEN (metrics->>'{name}')::float8 END",
            name = raw.name()
        ),
    }
}

/// Build the first-level aggregation query. Metric names come from the
/// closed `SeriesMetric` set, never from caller input.
fn bucket_stats_sql(query: &SeriesQuery) -> String {
    let mut sql = String::from(
        "SELECT device_id, (ts / $3) * $3 AS bucket_start, count(*) AS sample_count",
    );
    for metric in &query.metrics {
        let expr = metric_expression(*metric);
        sql.push_str(&format!(", avg({e}), min({e}), max({e})", e = expr));
    }
    sql.push_str(" FROM telemetry_samples WHERE ts >= $1 AND ts < $2");
    match &query.filter {
        DeviceFilter::All => {}
        DeviceFilter::Devices(_) => sql.push_str(" AND device_id = ANY($4)"),
        DeviceFilter::Profiles(_) => sql.push_str(
            " AND device_id IN (SELECT device_id FROM devices WHERE profile_id = ANY($4))",
        ),
    }
    sql.push_str(" GROUP BY device_id, bucket_start ORDER BY bucket_start, device_id");
    sql
}

fn latest_state_from_row(row: &Row) -> LatestState {
    let metrics: Option<Value> = row.get(2);
    let cop_quality: Option<String> = row.get(6);
    let faults: Value = row.get(8);

    LatestState {
        device_id: row.get(0),
        ts: row.get(1),
        metrics: match metrics {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        },
        derived: DerivedMetrics {
            delta_t: row.get(3),
            thermal_kw: row.get(4),
            cop: row.get(5),
            cop_quality: cop_quality.as_deref().and_then(CopQuality::parse),
        },
        status: row.get(7),
        faults: serde_json::from_value(faults).unwrap_or_default(),
        rssi: row.get(9),
        online: row.get(10),
        updated_at: row.get(11),
    }
}

/// PostgreSQL implementation of TelemetryRepository trait
#[derive(Clone)]
pub struct PostgresTelemetryRepository {
    client: PostgresClient,
    ordering: LatestStateOrdering,
}

impl PostgresTelemetryRepository {
    pub fn new(client: PostgresClient, ordering: LatestStateOrdering) -> Self {
        Self { client, ordering }
    }

    fn upsert_latest_sql(&self) -> String {
        match self.ordering {
            LatestStateOrdering::Received => UPSERT_LATEST.to_string(),
            LatestStateOrdering::Sensed => format!("{}{}", UPSERT_LATEST, SENSED_ORDER_GUARD),
        }
    }
}

#[async_trait]
impl TelemetryRepository for PostgresTelemetryRepository {
    #[instrument(skip(self, input), fields(device_id = %input.sample.device_id, ts = input.sample.ts))]
    async fn write_sample(&self, input: WriteSampleInput) -> DomainResult<WriteSampleOutcome> {
        let sample = &input.sample;
        let metrics = Value::Object(sample.metrics.clone());
        let faults = Value::from(sample.faults.clone());
        let cop_quality = sample.derived.cop_quality.map(|q| q.as_str());

        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let inserted = tx
            .execute(
                INSERT_SAMPLE,
                &[
                    &sample.device_id,
                    &sample.ts,
                    &metrics,
                    &sample.derived.delta_t,
                    &sample.derived.thermal_kw,
                    &sample.derived.cop,
                    &cop_quality,
                    &sample.status,
                    &faults,
                    &sample.rssi,
                    &sample.received_at,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.execute(
            self.upsert_latest_sql().as_str(),
            &[
                &sample.device_id,
                &sample.ts,
                &metrics,
                &sample.derived.delta_t,
                &sample.derived.thermal_kw,
                &sample.derived.cop,
                &cop_quality,
                &sample.status,
                &faults,
                &sample.rssi,
                &sample.received_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.execute(
            UPSERT_DEVICE_ONLINE,
            &[
                &input.device.device_id,
                &input.device.profile_id,
                &input.device.device_key_hash,
                &sample.received_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let inserted = inserted == 1;
        debug!(inserted, "stored telemetry sample");
        Ok(WriteSampleOutcome { inserted })
    }

    #[instrument(skip(self, input), fields(device_id = %input.device.device_id))]
    async fn write_heartbeat(&self, input: HeartbeatInput) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.execute(
            UPSERT_DEVICE_ONLINE,
            &[
                &input.device.device_id,
                &input.device.profile_id,
                &input.device.device_key_hash,
                &input.received_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.execute(
            UPSERT_LATEST_ONLINE,
            &[&input.device.device_id, &input.received_at],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("stored heartbeat");
        Ok(())
    }

    #[instrument(skip(self, device_ids), fields(count = device_ids.len()))]
    async fn get_latest_states(&self, device_ids: &[String]) -> DomainResult<Vec<LatestState>> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                format!(
                    "SELECT {} FROM latest_state WHERE device_id = ANY($1)",
                    LATEST_COLUMNS
                )
                .as_str(),
                &[&device_ids],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows.iter().map(latest_state_from_row).collect())
    }

    #[instrument(skip(self, query), fields(start_ms = query.start_ms, end_ms = query.end_ms, interval_ms = query.interval_ms))]
    async fn get_device_bucket_stats(
        &self,
        query: &SeriesQuery,
    ) -> DomainResult<Vec<DeviceBucketStats>> {
        let filter_ids = match &query.filter {
            DeviceFilter::All => None,
            DeviceFilter::Devices(ids) | DeviceFilter::Profiles(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                Some(ids)
            }
        };

        let sql = bucket_stats_sql(query);
        let mut params: Vec<&(dyn ToSql + Sync)> =
            vec![&query.start_ms, &query.end_ms, &query.interval_ms];
        if let Some(ids) = filter_ids {
            params.push(ids);
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let stats: Vec<DeviceBucketStats> = rows
            .iter()
            .map(|row| {
                let sample_count: i64 = row.get(2);
                let mut values = BTreeMap::new();
                for (i, metric) in query.metrics.iter().enumerate() {
                    let base = 3 + i * 3;
                    let avg: Option<f64> = row.get(base);
                    let min: Option<f64> = row.get(base + 1);
                    let max: Option<f64> = row.get(base + 2);
                    if let (Some(avg), Some(min), Some(max)) = (avg, min, max) {
                        values.insert(*metric, MetricStats { avg, min, max });
                    }
                }
                DeviceBucketStats {
                    device_id: row.get(0),
                    bucket_start: row.get(1),
                    sample_count: sample_count.max(0) as u64,
                    values,
                }
            })
            .collect();

        debug!("aggregated {} device buckets", stats.len());
        Ok(stats)
    }
}
