use http::HeaderMap;
use std::net::SocketAddr;

/// Resolve the client IP for rate limiting.
///
/// With `trust_forwarded_headers` set, the first `x-forwarded-for` hop wins,
/// then `x-real-ip`, then the socket peer. Only enable it behind a proxy that
/// overwrites these headers, otherwise any client can pick its own key.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(headers) {
            return ip;
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').map(str::trim).find(|ip| !ip.is_empty()));
    if let Some(ip) = xff {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
