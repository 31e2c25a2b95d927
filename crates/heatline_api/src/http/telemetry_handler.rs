use crate::domain::{LatestBatch, LatestBatchRequest, SeriesRequest, SeriesResponse, SeriesScope};
use crate::http::HeatlineApiServices;
use axum::extract::{Query, State};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use common::auth::extract_caller_scope;
use common::domain::{parse_interval, parse_metrics, DomainError, DomainResult};
use common::http::ApiError;
use http::HeaderMap;
use serde::Deserialize;
use tracing::instrument;

pub const DEFAULT_SERIES_METRICS: &str = "deltaT,thermalKW,cop";
pub const DEFAULT_SERIES_INTERVAL: &str = "5m";
pub const DEFAULT_SERIES_WINDOW_HOURS: i64 = 24;

/// Query string of `GET /telemetry/series`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesParams {
    pub scope: Option<String>,
    pub device: Option<String>,
    /// Comma-separated metric names
    pub metric: Option<String>,
    pub interval: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

fn parse_time(field: &str, value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DomainError::ValidationError(format!("{}: expected an ISO-8601 timestamp", field)))
}

/// Apply defaults and parse query parameters.
///
/// `scope` defaults to `device` when a device is given, else `fleet`; the
/// window defaults to the 24 hours ending now.
pub fn series_request(params: SeriesParams, now: DateTime<Utc>) -> DomainResult<SeriesRequest> {
    let scope = match params.scope.as_deref() {
        Some(scope) => SeriesScope::parse(scope)?,
        None if params.device.is_some() => SeriesScope::Device,
        None => SeriesScope::Fleet,
    };

    let metrics = parse_metrics(params.metric.as_deref().unwrap_or(DEFAULT_SERIES_METRICS))?;
    let interval_ms = parse_interval(params.interval.as_deref().unwrap_or(DEFAULT_SERIES_INTERVAL))?;

    let end = match params.end.as_deref() {
        Some(end) => parse_time("end", end)?,
        None => now,
    };
    let start = match params.start.as_deref() {
        Some(start) => parse_time("start", start)?,
        None => end - Duration::hours(DEFAULT_SERIES_WINDOW_HOURS),
    };

    Ok(SeriesRequest {
        scope,
        device: params.device,
        metrics,
        interval_ms,
        start_ms: start.timestamp_millis(),
        end_ms: end.timestamp_millis(),
    })
}

#[instrument(name = "LatestBatch", skip(services, headers, body))]
pub async fn latest_batch(
    State(services): State<HeatlineApiServices>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LatestBatch>, ApiError> {
    let scope = extract_caller_scope(&headers, services.caller_authenticator.as_ref())?;

    let request: LatestBatchRequest = serde_json::from_slice(&body)
        .map_err(|e| DomainError::ValidationError(format!("body: {}", e)))?;

    let batch = services.query_service.latest_batch(&scope, request).await?;
    Ok(Json(batch))
}

#[instrument(name = "Series", skip(services, headers, params))]
pub async fn series(
    State(services): State<HeatlineApiServices>,
    headers: HeaderMap,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let scope = extract_caller_scope(&headers, services.caller_authenticator.as_ref())?;
    let request = series_request(params, Utc::now())?;

    let response = services.query_service.series(&scope, request).await?;
    Ok(Json(response))
}
