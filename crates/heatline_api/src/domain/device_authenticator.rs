use chrono::{DateTime, Duration, Utc};
use common::auth::{device_key_matches, verify_device_signature};
use common::domain::{Device, DeviceRepository, DomainError, DomainResult, NonceRepository};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default allowed clock skew between device and server, in seconds
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Authentication headers presented by a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub device_key: Option<String>,
    /// ISO-8601 send time, signed together with the body
    pub timestamp: Option<String>,
    /// Hex HMAC-SHA256 of `timestamp + "." + body`
    pub signature: Option<String>,
}

/// Verifies signed device requests and records their nonces
///
/// Checks, in order:
/// 1. All three credential headers are present
/// 2. The device exists and the presented key hashes to its stored hash
/// 3. The device belongs to the tenant in the request path
/// 4. The timestamp is within the tolerance window, past or future
/// 5. The signature matches the body
/// 6. The `(device_id, signature)` nonce has not been seen within the window
///
/// Every failure is the same `Unauthorized` error to the caller; the reason is
/// only carried for logging.
pub struct DeviceAuthenticator {
    device_repository: Arc<dyn DeviceRepository>,
    nonce_repository: Arc<dyn NonceRepository>,
    tolerance: Duration,
}

fn reject(reason: &str) -> DomainError {
    DomainError::Unauthorized(reason.to_string())
}

impl DeviceAuthenticator {
    pub fn new(
        device_repository: Arc<dyn DeviceRepository>,
        nonce_repository: Arc<dyn NonceRepository>,
        tolerance: Duration,
    ) -> Self {
        Self {
            device_repository,
            nonce_repository,
            tolerance,
        }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    #[instrument(skip(self, credentials, body), fields(device_id = %device_id, tenant = %tenant))]
    pub async fn authenticate(
        &self,
        tenant: &str,
        device_id: &str,
        credentials: &DeviceCredentials,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> DomainResult<Device> {
        let (Some(device_key), Some(timestamp), Some(signature)) = (
            credentials.device_key.as_deref(),
            credentials.timestamp.as_deref(),
            credentials.signature.as_deref(),
        ) else {
            return Err(reject("missing_header"));
        };

        let device = self
            .device_repository
            .get_device(device_id)
            .await?
            .ok_or_else(|| reject("unknown_device"))?;

        if !device_key_matches(device_key, &device.device_key_hash) {
            return Err(reject("key_mismatch"));
        }

        if device.profile_id != tenant {
            return Err(reject("tenant_mismatch"));
        }

        let sent_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| reject("stale_timestamp"))?
            .with_timezone(&Utc);
        if (now - sent_at).abs() > self.tolerance {
            return Err(reject("stale_timestamp"));
        }

        if !verify_device_signature(&device.device_key_hash, timestamp, body, signature) {
            return Err(reject("bad_signature"));
        }

        let nonce = format!("{}:{}", device.device_id, signature.trim().to_ascii_lowercase());
        let recorded = self
            .nonce_repository
            .record_nonce(&nonce, now + self.tolerance, now)
            .await?;
        if !recorded {
            return Err(reject("replay"));
        }

        debug!("device request authenticated");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::auth::{sha256_hex, sign_device_request};
    use common::domain::{MockDeviceRepository, MockNonceRepository};

    const KEY: &str = "device-secret";
    const BODY: &[u8] = br#"{"device_id":"hp-1","ts":1714564800000,"metrics":{}}"#;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn device() -> Device {
        Device {
            device_id: "hp-1".to_string(),
            profile_id: "tenant-a".to_string(),
            device_key_hash: sha256_hex(KEY),
            online: false,
            last_seen_at: None,
        }
    }

    fn signed(timestamp: &str) -> DeviceCredentials {
        DeviceCredentials {
            device_key: Some(KEY.to_string()),
            timestamp: Some(timestamp.to_string()),
            signature: Some(sign_device_request(&sha256_hex(KEY), timestamp, BODY)),
        }
    }

    fn devices_returning_hp1() -> MockDeviceRepository {
        let mut mock = MockDeviceRepository::new();
        mock.expect_get_device()
            .withf(|id: &str| id == "hp-1")
            .returning(|_| Ok(Some(device())));
        mock
    }

    fn authenticator(
        devices: MockDeviceRepository,
        nonces: MockNonceRepository,
    ) -> DeviceAuthenticator {
        DeviceAuthenticator::new(
            Arc::new(devices),
            Arc::new(nonces),
            Duration::seconds(DEFAULT_TIMESTAMP_TOLERANCE_SECS),
        )
    }

    fn reason(result: DomainResult<Device>) -> String {
        match result {
            Err(DomainError::Unauthorized(reason)) => reason,
            other => panic!("expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authenticate_success_records_nonce() {
        let mut nonces = MockNonceRepository::new();
        let credentials = signed("2024-05-01T11:59:30Z");
        let expected_nonce = format!("hp-1:{}", credentials.signature.clone().unwrap());
        nonces
            .expect_record_nonce()
            .withf(move |nonce: &str, expires_at: &DateTime<Utc>, at: &DateTime<Utc>| {
                nonce == expected_nonce
                    && *expires_at == now() + Duration::seconds(300)
                    && *at == now()
            })
            .times(1)
            .return_once(|_, _, _| Ok(true));

        let auth = authenticator(devices_returning_hp1(), nonces);
        let device = auth
            .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
            .await
            .unwrap();

        assert_eq!(device.device_id, "hp-1");
    }

    #[tokio::test]
    async fn test_replay_rejected_on_second_attempt() {
        let mut nonces = MockNonceRepository::new();
        let mut seen = false;
        nonces.expect_record_nonce().times(2).returning(move |_, _, _| {
            let first = !seen;
            seen = true;
            Ok(first)
        });

        let auth = authenticator(devices_returning_hp1(), nonces);
        let credentials = signed("2024-05-01T12:00:00Z");

        assert!(auth
            .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
            .await
            .is_ok());
        let replay = auth
            .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
            .await;
        assert_eq!(reason(replay), "replay");
    }

    #[tokio::test]
    async fn test_missing_header_rejected_before_lookup() {
        let auth = authenticator(MockDeviceRepository::new(), MockNonceRepository::new());
        let mut credentials = signed("2024-05-01T12:00:00Z");
        credentials.signature = None;

        let result = auth
            .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
            .await;
        assert_eq!(reason(result), "missing_header");
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_device().times(1).return_once(|_| Ok(None));
        let auth = authenticator(devices, MockNonceRepository::new());

        let result = auth
            .authenticate("tenant-a", "hp-1", &signed("2024-05-01T12:00:00Z"), BODY, now())
            .await;
        assert_eq!(reason(result), "unknown_device");
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let auth = authenticator(devices_returning_hp1(), MockNonceRepository::new());
        let mut credentials = signed("2024-05-01T12:00:00Z");
        credentials.device_key = Some("guessed".to_string());

        let result = auth
            .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
            .await;
        assert_eq!(reason(result), "key_mismatch");
    }

    #[tokio::test]
    async fn test_other_tenant_rejected() {
        let auth = authenticator(devices_returning_hp1(), MockNonceRepository::new());

        let result = auth
            .authenticate("tenant-b", "hp-1", &signed("2024-05-01T12:00:00Z"), BODY, now())
            .await;
        assert_eq!(reason(result), "tenant_mismatch");
    }

    #[tokio::test]
    async fn test_stale_and_future_timestamps_rejected() {
        let auth = authenticator(devices_returning_hp1(), MockNonceRepository::new());

        for timestamp in ["2024-05-01T11:54:59Z", "2024-05-01T12:05:01Z", "yesterday"] {
            let credentials = DeviceCredentials {
                device_key: Some(KEY.to_string()),
                timestamp: Some(timestamp.to_string()),
                signature: Some(sign_device_request(&sha256_hex(KEY), timestamp, BODY)),
            };
            let result = auth
                .authenticate("tenant-a", "hp-1", &credentials, BODY, now())
                .await;
            assert_eq!(reason(result), "stale_timestamp", "timestamp {}", timestamp);
        }
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let auth = authenticator(devices_returning_hp1(), MockNonceRepository::new());

        let result = auth
            .authenticate(
                "tenant-a",
                "hp-1",
                &signed("2024-05-01T12:00:00Z"),
                br#"{"device_id":"hp-1","ts":1,"metrics":{}}"#,
                now(),
            )
            .await;
        assert_eq!(reason(result), "bad_signature");
    }
}
