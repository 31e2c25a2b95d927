use crate::postgres::PostgresConfig;
use anyhow::{Context, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Pooled PostgreSQL handle shared by every repository
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Build the pool. No connection is opened until first use.
    pub fn from_config(config: &PostgresConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = Some(config.password.clone());
        cfg.application_name = Some(config.application_name.clone());
        cfg.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create postgres pool")?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_pool_size = config.max_pool_size,
            "postgres pool created"
        );
        Ok(Self { pool })
    }

    /// Pool against `host:port` with default pool settings
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        max_pool_size: usize,
    ) -> Result<Self> {
        Self::from_config(&PostgresConfig {
            host: host.to_string(),
            port,
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            max_pool_size,
            ..Default::default()
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgres connection successful");
        Ok(())
    }

    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .context("failed to get postgres connection from pool")
    }
}
