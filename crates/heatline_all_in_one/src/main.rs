mod config;

use chrono::Utc;
use common::auth::{DeviceTokenizer, JwtCallerAuthenticator};
use common::domain::{
    ArchiveStore, BucketStore, InMemoryBucketStore, LatestStateOrdering, NonceRepository,
};
use common::http::OriginPolicy;
use common::nats::{NatsArchiveStore, NatsClient, NatsKvBucketStore};
use common::postgres::{
    apply_schema, PostgresClient, PostgresConfig, PostgresDeviceRepository,
    PostgresJobCursorStore, PostgresNonceRepository, PostgresOpsMetricsRecorder,
    PostgresRetentionRepository, PostgresTelemetryRepository,
};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use heatline_api::domain::{
    DeviceAuthenticator, RateLimiter, TelemetryIngestionService, TelemetryQueryService,
};
use heatline_api::heatline_api::HeatlineApi;
use heatline_api::http::HeatlineApiServices;
use heatline_runner::Runner;
use retention_worker::domain::RetentionService;
use retention_worker::retention_worker::RetentionWorker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + OpenTelemetry for traces and logs)
    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(provider) => provider,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "Starting heatline-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    // Initialize shared dependencies
    let deps = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {}", e);
            std::process::exit(1);
        }
    };

    let tokenizer = match DeviceTokenizer::new(config.device_token_secret.as_bytes()) {
        Ok(tokenizer) => Arc::new(tokenizer),
        Err(e) => {
            error!("Failed to initialize device tokenizer: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize domain services
    let authenticator = Arc::new(DeviceAuthenticator::new(
        deps.postgres.device.clone(),
        deps.postgres.nonce.clone(),
        chrono::Duration::seconds(config.auth_tolerance_secs as i64),
    ));
    let fallback_buckets = Arc::new(InMemoryBucketStore::default());
    let rate_limiter = Arc::new(RateLimiter::new(
        deps.bucket_store.clone(),
        fallback_buckets.clone(),
        config.rate_limiter_config(),
    ));
    let ingestion_service = Arc::new(TelemetryIngestionService::new(
        authenticator,
        rate_limiter,
        deps.postgres.telemetry.clone(),
        deps.postgres.ops_metrics.clone(),
        OriginPolicy::from_comma_separated(&config.allowed_origins),
        config.max_body_bytes,
    ));
    let query_service = Arc::new(TelemetryQueryService::new(
        deps.postgres.device.clone(),
        deps.postgres.telemetry.clone(),
        tokenizer,
    ));
    let retention_service = Arc::new(RetentionService::new(
        deps.postgres.retention.clone(),
        deps.archive_store.clone(),
        deps.postgres.job_cursor.clone(),
        config.retention_config(),
    ));

    // Initialize application modules
    let heatline_api = HeatlineApi::new(
        HeatlineApiServices {
            ingestion_service,
            query_service,
            caller_authenticator: Arc::new(JwtCallerAuthenticator::new(&config.jwt_secret)),
            trust_forwarded_headers: config.trust_forwarded_headers,
        },
        config.http_server_config(),
    );
    let retention_worker = RetentionWorker::new(
        retention_service,
        Duration::from_secs(config.retention_interval_secs),
    );

    // Build runner with all processes
    let mut runner = Runner::new();

    runner = runner.with_named_process("heatline_api", heatline_api.into_runner_process());

    runner = runner.with_interval_process(
        "nonce_sweep",
        Duration::from_secs(config.nonce_sweep_interval_secs),
        {
            let nonce_repository = deps.postgres.nonce.clone();
            move || {
                let nonce_repository = nonce_repository.clone();
                async move {
                    let pruned = nonce_repository.prune_expired(Utc::now()).await?;
                    debug!(pruned, "pruned expired nonces");
                    Ok::<(), anyhow::Error>(())
                }
            }
        },
    );

    runner = runner.with_interval_process(
        "bucket_sweep",
        Duration::from_secs(config.bucket_sweep_interval_secs),
        {
            let idle_ms = (config.bucket_idle_secs * 1_000) as i64;
            move || {
                let buckets = fallback_buckets.clone();
                async move {
                    let dropped = buckets.sweep(Utc::now().timestamp_millis(), idle_ms).await;
                    debug!(dropped, "swept idle rate-limit buckets");
                    Ok::<(), anyhow::Error>(())
                }
            }
        },
    );

    runner = runner.with_interval_process(
        "retention",
        retention_worker.interval(),
        retention_worker.into_interval_task(),
    );

    // Add cleanup handlers
    runner = runner
        .with_closer({
            let nats_for_close = deps.nats;
            move || {
                Box::pin(async move {
                    info!("Running cleanup tasks...");
                    if let Some(client) = nats_for_close.and_then(|c| Arc::try_unwrap(c).ok()) {
                        client.close().await;
                    }

                    // Shutdown telemetry and flush pending traces and logs
                    shutdown_telemetry(telemetry_providers);

                    info!("Cleanup complete");
                    Ok(())
                })
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    // Run the service
    runner.run().await;
}

struct PostgresRepositories {
    device: Arc<PostgresDeviceRepository>,
    telemetry: Arc<PostgresTelemetryRepository>,
    nonce: Arc<PostgresNonceRepository>,
    ops_metrics: Arc<PostgresOpsMetricsRecorder>,
    retention: Arc<PostgresRetentionRepository>,
    job_cursor: Arc<PostgresJobCursorStore>,
}

struct SharedDependencies {
    postgres: PostgresRepositories,
    nats: Option<Arc<NatsClient>>,
    bucket_store: Option<Arc<dyn BucketStore>>,
    archive_store: Option<Arc<dyn ArchiveStore>>,
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<SharedDependencies> {
    let ordering = LatestStateOrdering::parse(&config.latest_state_ordering).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown latest state ordering '{}', expected 'received' or 'sensed'",
            config.latest_state_ordering
        )
    })?;

    // PostgreSQL initialization
    info!("Initializing PostgreSQL...");
    let postgres_client = create_postgres_client(config)?;
    tokio::time::timeout(Duration::from_secs(config.startup_timeout_secs), async {
        postgres_client.ping().await?;
        apply_schema(&postgres_client).await
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out initializing PostgreSQL"))??;

    let postgres = PostgresRepositories {
        device: Arc::new(PostgresDeviceRepository::new(postgres_client.clone())),
        telemetry: Arc::new(PostgresTelemetryRepository::new(
            postgres_client.clone(),
            ordering,
        )),
        nonce: Arc::new(PostgresNonceRepository::new(postgres_client.clone())),
        ops_metrics: Arc::new(PostgresOpsMetricsRecorder::new(postgres_client.clone())),
        retention: Arc::new(PostgresRetentionRepository::new(postgres_client.clone())),
        job_cursor: Arc::new(PostgresJobCursorStore::new(postgres_client)),
    };

    // NATS initialization. Without it the limiter runs per instance and
    // retention has no archive destination.
    info!("Initializing NATS...");
    let nats = match NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await
    {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "NATS unavailable, using in-memory rate limiting only");
            None
        }
    };

    let mut bucket_store: Option<Arc<dyn BucketStore>> = None;
    let mut archive_store: Option<Arc<dyn ArchiveStore>> = None;
    if let Some(client) = &nats {
        let kv = client
            .ensure_kv_bucket(
                &config.nats_kv_bucket,
                Duration::from_secs(config.bucket_idle_secs),
            )
            .await?;
        bucket_store = Some(Arc::new(NatsKvBucketStore::new(kv)));

        if !config.archive_bucket.is_empty() {
            let store = client.ensure_object_store(&config.archive_bucket).await?;
            archive_store = Some(Arc::new(NatsArchiveStore::new(store)));
        }
    }

    if archive_store.is_none() && config.retention_backup_required && !config.retention_dry_run {
        warn!("no retention archive destination configured, retention runs will refuse to delete");
    }

    Ok(SharedDependencies {
        postgres,
        nats,
        bucket_store,
        archive_store,
    })
}

fn create_postgres_client(config: &ServiceConfig) -> anyhow::Result<PostgresClient> {
    PostgresClient::from_config(&PostgresConfig {
        host: config.postgres_host.clone(),
        port: config.postgres_port,
        database: config.postgres_database.clone(),
        username: config.postgres_username.clone(),
        password: config.postgres_password.clone(),
        max_pool_size: config.postgres_max_pool_size,
        application_name: config.otel_service_name.clone(),
        connect_timeout_secs: config.startup_timeout_secs,
    })
}
