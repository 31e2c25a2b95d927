use serde::{Deserialize, Serialize};

/// Connection settings for the telemetry database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_pool_size: usize,
    /// Reported in `pg_stat_activity`
    pub application_name: String,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "heatline".to_string(),
            username: "heatline".to_string(),
            password: "heatline".to_string(),
            max_pool_size: 10,
            application_name: "heatline".to_string(),
            connect_timeout_secs: 10,
        }
    }
}
