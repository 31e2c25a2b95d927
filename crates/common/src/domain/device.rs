use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Registered heat-pump controller
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub device_id: String,
    pub profile_id: String,
    /// Hex SHA-256 of the device's shared key. Also the HMAC secret for
    /// request signatures.
    pub device_key_hash: String,
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Identity written alongside every accepted ingest or heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub profile_id: String,
    pub device_key_hash: String,
}

impl From<&Device> for DeviceRegistration {
    fn from(device: &Device) -> Self {
        DeviceRegistration {
            device_id: device.device_id.clone(),
            profile_id: device.profile_id.clone(),
            device_key_hash: device.device_key_hash.clone(),
        }
    }
}

/// Repository trait for device registration lookups
/// Infrastructure layer (e.g., common::postgres) implements this trait
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Get a single device by ID
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>>;

    /// Get every device in `device_ids` that exists; unknown IDs are skipped
    async fn get_devices(&self, device_ids: &[String]) -> DomainResult<Vec<Device>>;
}
