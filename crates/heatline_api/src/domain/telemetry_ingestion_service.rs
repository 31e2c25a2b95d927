use crate::domain::{DeviceAuthenticator, DeviceCredentials, RateLimiter};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::domain::{
    derive_metrics, Device, DomainError, DomainResult, HeartbeatInput, OpsMetric,
    OpsMetricsRecorder, TelemetryRepository, TelemetrySample, WriteSampleInput,
    WriteSampleOutcome,
};
use common::http::{domain_error_status, OriginPolicy};
use garde::Validate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

pub const INGEST_ROUTE: &str = "ingest";
pub const HEARTBEAT_ROUTE: &str = "heartbeat";

/// Default request body ceiling in bytes
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Telemetry body posted by a device
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IngestPayload {
    #[garde(length(min = 1, max = 128))]
    pub device_id: String,
    /// Sensed time, epoch milliseconds
    #[garde(range(min = 0))]
    pub ts: i64,
    #[garde(skip)]
    pub metrics: Map<String, Value>,
    #[garde(skip)]
    #[serde(default)]
    pub faults: Vec<String>,
    #[garde(skip)]
    #[serde(default)]
    pub rssi: Option<i32>,
    #[garde(skip)]
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HeartbeatPayload {
    #[garde(length(min = 1, max = 128))]
    pub device_id: String,
    #[garde(range(min = 0))]
    pub ts: i64,
}

/// A signed device request as received at the edge
#[derive(Debug, Clone, Default)]
pub struct DeviceRequest {
    /// Tenant named in the route path
    pub tenant: String,
    pub client_ip: String,
    pub origin: Option<String>,
    /// Declared `Content-Length`, if any
    pub content_length: Option<usize>,
    pub credentials: DeviceCredentials,
    pub body: Bytes,
}

/// Domain service for the device write path
///
/// Flow for each request:
/// 1. Origin allowlist and per-IP rate limit
/// 2. Body size ceiling, checked on the declared and actual length before parsing
/// 3. Parse and validate the JSON body
/// 4. Authenticate the signed request and apply the per-device rate limit
/// 5. Derive metrics and write sample, latest state and device in one transaction
/// 6. Record an ops metric for the request, success or failure
pub struct TelemetryIngestionService {
    authenticator: Arc<DeviceAuthenticator>,
    rate_limiter: Arc<RateLimiter>,
    telemetry_repository: Arc<dyn TelemetryRepository>,
    ops_metrics: Arc<dyn OpsMetricsRecorder>,
    origin_policy: OriginPolicy,
    max_body_bytes: usize,
}

impl TelemetryIngestionService {
    pub fn new(
        authenticator: Arc<DeviceAuthenticator>,
        rate_limiter: Arc<RateLimiter>,
        telemetry_repository: Arc<dyn TelemetryRepository>,
        ops_metrics: Arc<dyn OpsMetricsRecorder>,
        origin_policy: OriginPolicy,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            authenticator,
            rate_limiter,
            telemetry_repository,
            ops_metrics,
            origin_policy,
            max_body_bytes,
        }
    }

    /// Accept a telemetry sample. A duplicate `(device_id, ts)` succeeds with
    /// `inserted == false`.
    #[instrument(skip(self, request), fields(tenant = %request.tenant, client_ip = %request.client_ip))]
    pub async fn ingest(&self, request: DeviceRequest) -> DomainResult<WriteSampleOutcome> {
        let started = Instant::now();
        let now = Utc::now();
        let mut device_id = None;

        let result = self.ingest_sample(request, now, &mut device_id).await;
        self.record_ops_metric(INGEST_ROUTE, &result, started, device_id, now)
            .await;
        result
    }

    /// Accept a heartbeat: device online and latest-state online flag only
    #[instrument(skip(self, request), fields(tenant = %request.tenant, client_ip = %request.client_ip))]
    pub async fn heartbeat(&self, request: DeviceRequest) -> DomainResult<()> {
        let started = Instant::now();
        let now = Utc::now();
        let mut device_id = None;

        let result = self.ingest_heartbeat(request, now, &mut device_id).await;
        self.record_ops_metric(HEARTBEAT_ROUTE, &result, started, device_id, now)
            .await;
        result
    }

    async fn ingest_sample(
        &self,
        request: DeviceRequest,
        now: DateTime<Utc>,
        device_id: &mut Option<String>,
    ) -> DomainResult<WriteSampleOutcome> {
        let payload: IngestPayload = self.admit(INGEST_ROUTE, &request, now).await?;
        *device_id = Some(payload.device_id.clone());

        let device = self
            .authenticate(&request, &payload.device_id, now)
            .await?;

        let derived = derive_metrics(&payload.metrics);
        debug!(
            device_id = %device.device_id,
            ts = payload.ts,
            delta_t = ?derived.delta_t,
            cop = ?derived.cop,
            "writing telemetry sample"
        );

        let outcome = self
            .telemetry_repository
            .write_sample(WriteSampleInput {
                device: (&device).into(),
                sample: TelemetrySample {
                    device_id: device.device_id.clone(),
                    ts: payload.ts,
                    metrics: payload.metrics,
                    derived,
                    status: payload.status,
                    faults: payload.faults,
                    rssi: payload.rssi,
                    received_at: now,
                },
            })
            .await?;

        if !outcome.inserted {
            debug!(device_id = %device.device_id, ts = payload.ts, "duplicate sample ignored");
        }

        Ok(outcome)
    }

    async fn ingest_heartbeat(
        &self,
        request: DeviceRequest,
        now: DateTime<Utc>,
        device_id: &mut Option<String>,
    ) -> DomainResult<()> {
        let payload: HeartbeatPayload = self.admit(HEARTBEAT_ROUTE, &request, now).await?;
        *device_id = Some(payload.device_id.clone());

        let device = self
            .authenticate(&request, &payload.device_id, now)
            .await?;

        self.telemetry_repository
            .write_heartbeat(HeartbeatInput {
                device: (&device).into(),
                ts: payload.ts,
                received_at: now,
            })
            .await?;

        debug!(device_id = %device.device_id, "heartbeat recorded");
        Ok(())
    }

    /// Checks that run before the device is known: origin, per-IP limit,
    /// body size, then JSON parsing and field validation
    async fn admit<P>(&self, route: &str, request: &DeviceRequest, now: DateTime<Utc>) -> DomainResult<P>
    where
        P: DeserializeOwned + Validate,
        P::Context: Default,
    {
        self.origin_policy.check(request.origin.as_deref())?;

        self.rate_limiter
            .check_ip(route, &request.client_ip, now.timestamp_millis())
            .await?;

        let declared = request.content_length.unwrap_or(0);
        let actual = request.body.len().max(declared);
        if actual > self.max_body_bytes {
            return Err(DomainError::PayloadTooLarge {
                limit: self.max_body_bytes,
                actual,
            });
        }

        let payload: P = serde_json::from_slice(&request.body)
            .map_err(|e| DomainError::ValidationError(format!("body: {}", e)))?;
        common::garde::validate_struct(&payload)?;

        Ok(payload)
    }

    async fn authenticate(
        &self,
        request: &DeviceRequest,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Device> {
        let device = self
            .authenticator
            .authenticate(
                &request.tenant,
                device_id,
                &request.credentials,
                &request.body,
                now,
            )
            .await?;

        self.rate_limiter
            .check_device(&device.device_id, now.timestamp_millis())
            .await?;

        Ok(device)
    }

    /// Secondary step: a recorder failure is logged and never changes the
    /// request outcome
    async fn record_ops_metric<T>(
        &self,
        route: &str,
        result: &DomainResult<T>,
        started: Instant,
        device_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        let status = match result {
            Ok(_) => 200,
            Err(e) => domain_error_status(e).as_u16(),
        };

        let metric = OpsMetric {
            route: route.to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            device_id,
            recorded_at: now,
        };

        if let Err(e) = self.ops_metrics.record(metric).await {
            warn!(route = %route, status, error = %e, "failed to record ops metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RateLimiterConfig;
    use chrono::{Duration, SecondsFormat};
    use common::auth::{sha256_hex, sign_device_request};
    use common::domain::{
        CopQuality, MockDeviceRepository, MockNonceRepository, MockOpsMetricsRecorder,
        MockTelemetryRepository, RateLimitPolicy,
    };

    const KEY: &str = "device-secret";

    fn device() -> Device {
        Device {
            device_id: "hp-1".to_string(),
            profile_id: "tenant-a".to_string(),
            device_key_hash: sha256_hex(KEY),
            online: true,
            last_seen_at: None,
        }
    }

    fn signed_request(body: &str) -> DeviceRequest {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = sign_device_request(&sha256_hex(KEY), &timestamp, body.as_bytes());
        DeviceRequest {
            tenant: "tenant-a".to_string(),
            client_ip: "10.0.0.1".to_string(),
            origin: None,
            content_length: Some(body.len()),
            credentials: DeviceCredentials {
                device_key: Some(KEY.to_string()),
                timestamp: Some(timestamp),
                signature: Some(signature),
            },
            body: Bytes::from(body.to_string()),
        }
    }

    fn known_device() -> MockDeviceRepository {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_device().returning(|_| Ok(Some(device())));
        devices
    }

    fn accepting_nonces() -> MockNonceRepository {
        let mut nonces = MockNonceRepository::new();
        nonces.expect_record_nonce().returning(|_, _, _| Ok(true));
        nonces
    }

    fn recording_metrics(expected_status: u16) -> MockOpsMetricsRecorder {
        let mut metrics = MockOpsMetricsRecorder::new();
        metrics
            .expect_record()
            .withf(move |metric: &OpsMetric| metric.status == expected_status)
            .times(1)
            .return_once(|_| Ok(()));
        metrics
    }

    fn service(
        devices: MockDeviceRepository,
        nonces: MockNonceRepository,
        telemetry: MockTelemetryRepository,
        metrics: MockOpsMetricsRecorder,
    ) -> TelemetryIngestionService {
        let authenticator = DeviceAuthenticator::new(Arc::new(devices), Arc::new(nonces), Duration::seconds(300));
        let rate_limiter = RateLimiter::in_memory(RateLimiterConfig {
            ip_policy: RateLimitPolicy::per_minute(100, 60),
            device_policy: Some(RateLimitPolicy::per_minute(100, 60)),
            ..RateLimiterConfig::default()
        });
        TelemetryIngestionService::new(
            Arc::new(authenticator),
            Arc::new(rate_limiter),
            Arc::new(telemetry),
            Arc::new(metrics),
            OriginPolicy::from_comma_separated("https://app.example.com"),
            1024,
        )
    }

    const BODY: &str = r#"{"device_id":"hp-1","ts":1714564800000,"metrics":{"supplyC":47,"returnC":38,"flowLps":32,"powerKW":1.4},"faults":["E1"],"rssi":-61}"#;

    #[tokio::test]
    async fn test_ingest_success_writes_derived_metrics() {
        let mut telemetry = MockTelemetryRepository::new();
        telemetry
            .expect_write_sample()
            .withf(|input: &WriteSampleInput| {
                input.device.device_id == "hp-1"
                    && input.device.profile_id == "tenant-a"
                    && input.sample.ts == 1714564800000
                    && input.sample.derived.delta_t == Some(9.0)
                    && input.sample.derived.cop_quality == Some(CopQuality::Measured)
                    && input.sample.faults == vec!["E1".to_string()]
                    && input.sample.rssi == Some(-61)
            })
            .times(1)
            .return_once(|_| Ok(WriteSampleOutcome { inserted: true }));

        let service = service(known_device(), accepting_nonces(), telemetry, recording_metrics(200));

        let outcome = service.ingest(signed_request(BODY)).await.unwrap();
        assert!(outcome.inserted);
    }

    #[tokio::test]
    async fn test_duplicate_sample_is_not_an_error() {
        let mut telemetry = MockTelemetryRepository::new();
        let mut calls = 0;
        telemetry.expect_write_sample().times(2).returning(move |_| {
            calls += 1;
            Ok(WriteSampleOutcome { inserted: calls == 1 })
        });
        let mut metrics = MockOpsMetricsRecorder::new();
        metrics
            .expect_record()
            .withf(|metric: &OpsMetric| metric.status == 200)
            .times(2)
            .returning(|_| Ok(()));

        let service = service(known_device(), accepting_nonces(), telemetry, metrics);

        let first = service.ingest(signed_request(BODY)).await.unwrap();
        let second = service.ingest(signed_request(BODY)).await.unwrap();
        assert!(first.inserted);
        assert!(!second.inserted);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_parsing() {
        let service = service(
            MockDeviceRepository::new(),
            MockNonceRepository::new(),
            MockTelemetryRepository::new(),
            recording_metrics(413),
        );

        let mut request = signed_request("{}");
        request.content_length = Some(4096);

        let result = service.ingest(request).await;
        assert!(matches!(
            result,
            Err(DomainError::PayloadTooLarge { limit: 1024, actual: 4096 })
        ));
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let service = service(
            MockDeviceRepository::new(),
            MockNonceRepository::new(),
            MockTelemetryRepository::new(),
            recording_metrics(400),
        );

        let result = service
            .ingest(signed_request(r#"{"device_id":"hp-1","ts":1}"#))
            .await;
        match result {
            Err(DomainError::ValidationError(detail)) => assert!(detail.contains("metrics")),
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disallowed_origin_rejected() {
        let service = service(
            MockDeviceRepository::new(),
            MockNonceRepository::new(),
            MockTelemetryRepository::new(),
            recording_metrics(403),
        );

        let mut request = signed_request(BODY);
        request.origin = Some("https://evil.example.com".to_string());

        let result = service.ingest(request).await;
        assert!(matches!(result, Err(DomainError::OriginNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let mut nonces = MockNonceRepository::new();
        nonces.expect_record_nonce().times(1).return_once(|_, _, _| Ok(false));

        let service = service(
            known_device(),
            nonces,
            MockTelemetryRepository::new(),
            recording_metrics(401),
        );

        let result = service.ingest(signed_request(BODY)).await;
        assert!(matches!(result, Err(DomainError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_still_records_metric() {
        let mut telemetry = MockTelemetryRepository::new();
        telemetry.expect_write_sample().times(1).return_once(|_| {
            Err(DomainError::RepositoryError(anyhow::anyhow!(
                "transaction aborted"
            )))
        });

        let mut metrics = MockOpsMetricsRecorder::new();
        metrics
            .expect_record()
            .withf(|metric: &OpsMetric| {
                metric.status == 500 && metric.route == INGEST_ROUTE && metric.device_id.as_deref() == Some("hp-1")
            })
            .times(1)
            .return_once(|_| Ok(()));

        let service = service(known_device(), accepting_nonces(), telemetry, metrics);

        let result = service.ingest(signed_request(BODY)).await;
        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }

    #[tokio::test]
    async fn test_metric_failure_does_not_fail_ingest() {
        let mut telemetry = MockTelemetryRepository::new();
        telemetry
            .expect_write_sample()
            .times(1)
            .return_once(|_| Ok(WriteSampleOutcome { inserted: true }));

        let mut metrics = MockOpsMetricsRecorder::new();
        metrics.expect_record().times(1).return_once(|_| {
            Err(DomainError::RepositoryError(anyhow::anyhow!(
                "ops_metrics unavailable"
            )))
        });

        let service = service(known_device(), accepting_nonces(), telemetry, metrics);

        assert!(service.ingest(signed_request(BODY)).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_writes_reduced_record() {
        let mut telemetry = MockTelemetryRepository::new();
        telemetry
            .expect_write_heartbeat()
            .withf(|input: &HeartbeatInput| input.device.device_id == "hp-1" && input.ts == 1714564800000)
            .times(1)
            .return_once(|_| Ok(()));

        let mut metrics = MockOpsMetricsRecorder::new();
        metrics
            .expect_record()
            .withf(|metric: &OpsMetric| metric.route == HEARTBEAT_ROUTE && metric.status == 200)
            .times(1)
            .return_once(|_| Ok(()));

        let service = service(known_device(), accepting_nonces(), telemetry, metrics);

        let result = service
            .heartbeat(signed_request(r#"{"device_id":"hp-1","ts":1714564800000}"#))
            .await;
        assert!(result.is_ok());
    }
}
