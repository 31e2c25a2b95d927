use crate::domain::{DeviceCredentials, DeviceRequest};
use crate::http::HeatlineApiServices;
use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use bytes::Bytes;
use common::http::{client_ip, ApiError};
use http::{header, HeaderMap};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{debug, instrument};

pub const DEVICE_KEY_HEADER: &str = "device-key";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const SIGNATURE_HEADER: &str = "signature";

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Collect everything the write path needs from the raw request
pub fn device_request(
    tenant: String,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
    headers: &HeaderMap,
    body: Bytes,
) -> DeviceRequest {
    DeviceRequest {
        tenant,
        client_ip: client_ip(headers, peer, trust_forwarded_headers),
        origin: header_str(headers, header::ORIGIN.as_str()),
        content_length: header_str(headers, header::CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse().ok()),
        credentials: DeviceCredentials {
            device_key: header_str(headers, DEVICE_KEY_HEADER),
            timestamp: header_str(headers, TIMESTAMP_HEADER),
            signature: header_str(headers, SIGNATURE_HEADER),
        },
        body,
    }
}

#[instrument(name = "Ingest", skip(services, connect_info, headers, body), fields(tenant = %tenant))]
pub async fn ingest(
    State(services): State<HeatlineApiServices>,
    Path(tenant): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request = device_request(
        tenant,
        connect_info.map(|ConnectInfo(addr)| addr),
        services.trust_forwarded_headers,
        &headers,
        body,
    );

    let outcome = services.ingestion_service.ingest(request).await?;

    debug!(inserted = outcome.inserted, "ingest accepted");
    Ok(Json(json!({ "ok": true })))
}

#[instrument(name = "Heartbeat", skip(services, connect_info, headers, body), fields(tenant = %tenant))]
pub async fn heartbeat(
    State(services): State<HeatlineApiServices>,
    Path(tenant): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request = device_request(
        tenant,
        connect_info.map(|ConnectInfo(addr)| addr),
        services.trust_forwarded_headers,
        &headers,
        body,
    );

    services.ingestion_service.heartbeat(request).await?;

    Ok(Json(json!({ "ok": true })))
}
