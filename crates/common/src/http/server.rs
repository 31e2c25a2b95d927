//! Reusable axum server with request logging, tracing and graceful shutdown.
//!
//! # Example
//!
//! ```ignore
//! use common::http::{run_http_server, HttpServerConfig};
//!
//! let router = Router::new().route("/healthz", get(|| async { "ok" }));
//! run_http_server(HttpServerConfig::default(), router, cancellation_token).await?;
//! ```

use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::{HttpLoggingConfig, HttpLoggingLayer};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    pub logging_config: HttpLoggingConfig,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            logging_config: HttpLoggingConfig::default(),
        }
    }
}

/// Serve `router` until `cancellation_token` is cancelled.
///
/// Handlers may extract `ConnectInfo<SocketAddr>`.
pub async fn run_http_server(
    config: HttpServerConfig,
    router: Router,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid server address {}:{}", config.host, config.port))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    debug!(address = %addr, "starting HTTP server");

    let app = router
        .layer(HttpLoggingLayer::new(config.logging_config.clone()))
        .layer(TraceLayer::new_for_http());

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancellation_token.cancelled().await;
        debug!("HTTP server shutdown signal received");
    });

    match serve.await {
        Ok(_) => {
            debug!("HTTP server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            tracing::error!("HTTP server error: {}", e);
            Err(e.into())
        }
    }
}
