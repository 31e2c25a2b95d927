use crate::domain::{Device, DeviceRepository, DomainError, DomainResult};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const DEVICE_COLUMNS: &str = "device_id, profile_id, device_key_hash, online, last_seen_at";

fn device_from_row(row: &Row) -> Device {
    Device {
        device_id: row.get(0),
        profile_id: row.get(1),
        device_key_hash: row.get(2),
        online: row.get(3),
        last_seen_at: row.get(4),
    }
}

/// PostgreSQL implementation of DeviceRepository trait
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS).as_str(),
                &[&device_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.as_ref().map(device_from_row))
    }

    #[instrument(skip(self, device_ids), fields(count = device_ids.len()))]
    async fn get_devices(&self, device_ids: &[String]) -> DomainResult<Vec<Device>> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                format!(
                    "SELECT {} FROM devices WHERE device_id = ANY($1) ORDER BY device_id",
                    DEVICE_COLUMNS
                )
                .as_str(),
                &[&device_ids],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let devices: Vec<Device> = rows.iter().map(device_from_row).collect();
        debug!("found {} of {} devices", devices.len(), device_ids.len());
        Ok(devices)
    }
}
