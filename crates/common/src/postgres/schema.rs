//! Idempotent schema for the telemetry store.
//!
//! Applied once at startup. Every statement is `IF NOT EXISTS`, so running it
//! against an existing database is a no-op.

use crate::postgres::PostgresClient;
use anyhow::{Context, Result};
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        device_id       TEXT        PRIMARY KEY,
        profile_id      TEXT        NOT NULL,
        device_key_hash TEXT        NOT NULL,
        online          BOOLEAN     NOT NULL DEFAULT FALSE,
        last_seen_at    TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_devices_profile_id ON devices (profile_id)",
    r#"
    CREATE TABLE IF NOT EXISTS telemetry_samples (
        device_id   TEXT             NOT NULL,
        ts          BIGINT           NOT NULL,
        metrics     JSONB            NOT NULL,
        delta_t     DOUBLE PRECISION,
        thermal_kw  DOUBLE PRECISION,
        cop         DOUBLE PRECISION,
        cop_quality TEXT,
        status      JSONB,
        faults      JSONB            NOT NULL DEFAULT '[]'::jsonb,
        rssi        INTEGER,
        received_at TIMESTAMPTZ      NOT NULL,
        PRIMARY KEY (device_id, ts)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_telemetry_samples_ts ON telemetry_samples (ts)",
    r#"
    CREATE TABLE IF NOT EXISTS latest_state (
        device_id   TEXT             PRIMARY KEY,
        ts          BIGINT,
        metrics     JSONB,
        delta_t     DOUBLE PRECISION,
        thermal_kw  DOUBLE PRECISION,
        cop         DOUBLE PRECISION,
        cop_quality TEXT,
        status      JSONB,
        faults      JSONB            NOT NULL DEFAULT '[]'::jsonb,
        rssi        INTEGER,
        online      BOOLEAN          NOT NULL DEFAULT FALSE,
        updated_at  TIMESTAMPTZ      NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest_nonces (
        nonce      TEXT        PRIMARY KEY,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ingest_nonces_expires_at ON ingest_nonces (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS ops_metrics (
        id          BIGSERIAL   PRIMARY KEY,
        route       TEXT        NOT NULL,
        status      INTEGER     NOT NULL,
        duration_ms BIGINT      NOT NULL,
        device_id   TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ops_metrics_created_at ON ops_metrics (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS job_cursors (
        job_name   TEXT        PRIMARY KEY,
        next_table INTEGER     NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Create tables and indexes if they do not exist, in a single transaction
pub async fn apply_schema(client: &PostgresClient) -> Result<()> {
    let mut conn = client.get_connection().await?;
    let tx = conn.transaction().await?;

    for statement in SCHEMA {
        tx.batch_execute(statement)
            .await
            .with_context(|| format!("failed to apply schema statement: {}", statement.trim()))?;
    }

    tx.commit().await?;
    debug!(statements = SCHEMA.len(), "database schema applied");
    Ok(())
}
