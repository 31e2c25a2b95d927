use crate::domain::{TelemetryIngestionService, TelemetryQueryService};
use crate::http::{heartbeat, ingest, latest_batch, series};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::auth::CallerAuthenticator;
use common::http::{run_http_server, HttpServerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct HeatlineApiServices {
    pub ingestion_service: Arc<TelemetryIngestionService>,
    pub query_service: Arc<TelemetryQueryService>,
    pub caller_authenticator: Arc<dyn CallerAuthenticator>,
    /// Key per-IP limits on `x-forwarded-for`/`x-real-ip` instead of the socket peer
    pub trust_forwarded_headers: bool,
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// All API routes with state attached
pub fn build_heatline_api_routes(services: HeatlineApiServices) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ingest/:tenant", post(ingest))
        .route("/heartbeat/:tenant", post(heartbeat))
        .route("/telemetry/latest-batch", post(latest_batch))
        .route("/telemetry/series", get(series))
        .with_state(services)
}

/// Run the HTTP API until cancelled
pub async fn run_heatline_http_server(
    config: HttpServerConfig,
    services: HeatlineApiServices,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    info!(host = %config.host, port = config.port, "starting heatline API");
    run_http_server(config, build_heatline_api_routes(services), cancellation_token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceAuthenticator, RateLimiter, RateLimiterConfig, DEFAULT_MAX_BODY_BYTES};
    use axum::body::{to_bytes, Body};
    use chrono::Duration;
    use common::auth::{DeviceTokenizer, MockCallerAuthenticator};
    use common::domain::{
        CallerScope, DomainError, MockDeviceRepository, MockNonceRepository,
        MockOpsMetricsRecorder, MockTelemetryRepository,
    };
    use common::http::OriginPolicy;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    fn services(
        caller: MockCallerAuthenticator,
        query_telemetry: MockTelemetryRepository,
    ) -> HeatlineApiServices {
        let mut ops_metrics = MockOpsMetricsRecorder::new();
        ops_metrics.expect_record().returning(|_| Ok(()));

        let authenticator = DeviceAuthenticator::new(
            Arc::new(MockDeviceRepository::new()),
            Arc::new(MockNonceRepository::new()),
            Duration::seconds(300),
        );
        let ingestion_service = TelemetryIngestionService::new(
            Arc::new(authenticator),
            Arc::new(RateLimiter::in_memory(RateLimiterConfig::default())),
            Arc::new(MockTelemetryRepository::new()),
            Arc::new(ops_metrics),
            OriginPolicy::allow_all(),
            DEFAULT_MAX_BODY_BYTES,
        );

        let tokenizer = DeviceTokenizer::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let query_service = TelemetryQueryService::new(
            Arc::new(MockDeviceRepository::new()),
            Arc::new(query_telemetry),
            Arc::new(tokenizer),
        );

        HeatlineApiServices {
            ingestion_service: Arc::new(ingestion_service),
            query_service: Arc::new(query_service),
            caller_authenticator: Arc::new(caller),
            trust_forwarded_headers: false,
        }
    }

    fn router() -> Router {
        build_heatline_api_routes(services(
            MockCallerAuthenticator::new(),
            MockTelemetryRepository::new(),
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unsigned_ingest_is_unauthorized() {
        let request = Request::builder()
            .method("POST")
            .uri("/ingest/tenant-a")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"device_id":"hp-1","ts":1,"metrics":{}}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({ "error": "unauthorized" }));
    }

    #[tokio::test]
    async fn test_malformed_heartbeat_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/heartbeat/tenant-a")
            .body(Body::from("not json"))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_latest_batch_requires_bearer_token() {
        let request = Request::builder()
            .method("POST")
            .uri("/telemetry/latest-batch")
            .body(Body::from(r#"{"devices":["enc.x"]}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_latest_batch_invalid_token() {
        let mut caller = MockCallerAuthenticator::new();
        caller
            .expect_authenticate()
            .returning(|_| Err(DomainError::InvalidToken("expired".to_string())));

        let request = Request::builder()
            .method("POST")
            .uri("/telemetry/latest-batch")
            .header("authorization", "Bearer stale")
            .body(Body::from(r#"{"devices":["enc.x"]}"#))
            .unwrap();

        let response = build_heatline_api_routes(services(caller, MockTelemetryRepository::new()))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_latest_batch_unknown_tokens_are_missing() {
        let mut caller = MockCallerAuthenticator::new();
        caller
            .expect_authenticate()
            .returning(|_| Ok(CallerScope::tenant(["tenant-a"])));

        let request = Request::builder()
            .method("POST")
            .uri("/telemetry/latest-batch")
            .header("authorization", "Bearer ok")
            .body(Body::from(r#"{"devices":["enc.forged","hp-1"]}"#))
            .unwrap();

        let response = build_heatline_api_routes(services(caller, MockTelemetryRepository::new()))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "items": [], "missing": ["enc.forged", "hp-1"] })
        );
    }

    #[tokio::test]
    async fn test_fleet_series_for_admin() {
        let mut caller = MockCallerAuthenticator::new();
        caller.expect_authenticate().returning(|_| Ok(CallerScope::Admin));

        let mut telemetry = MockTelemetryRepository::new();
        telemetry
            .expect_get_device_bucket_stats()
            .times(1)
            .return_once(|_| Ok(vec![]));

        let request = Request::builder()
            .uri("/telemetry/series?scope=fleet&metric=cop&interval=1h&start=2024-05-01T00:00:00Z&end=2024-05-02T00:00:00Z")
            .header("authorization", "Bearer ok")
            .body(Body::empty())
            .unwrap();

        let response = build_heatline_api_routes(services(caller, telemetry))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "interval_ms": 3_600_000, "scope": "fleet", "series": [] })
        );
    }
}
