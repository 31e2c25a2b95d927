use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv, object_store};
use std::time::Duration;
use tracing::{debug, info};

pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        // Configure connection timeout for establishing the TCP connection
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .request_timeout(Some(timeout))
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client);

        info!("Successfully connected to NATS");
        Ok(Self { jetstream })
    }

    /// Get or create a KV bucket whose entries expire after `max_age`
    pub async fn ensure_kv_bucket(&self, bucket: &str, max_age: Duration) -> Result<kv::Store> {
        match self.jetstream.get_key_value(bucket).await {
            Ok(store) => {
                debug!(bucket = %bucket, "kv bucket already exists");
                Ok(store)
            }
            Err(_) => {
                debug!(bucket = %bucket, max_age_secs = max_age.as_secs(), "creating kv bucket");
                self.jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        description: "Rate-limit token buckets".to_string(),
                        history: 1,
                        max_age,
                        ..Default::default()
                    })
                    .await
                    .context("failed to create kv bucket")
            }
        }
    }

    /// Get or create an object store bucket
    pub async fn ensure_object_store(&self, bucket: &str) -> Result<object_store::ObjectStore> {
        match self.jetstream.get_object_store(bucket).await {
            Ok(store) => {
                debug!(bucket = %bucket, "object store bucket already exists");
                Ok(store)
            }
            Err(_) => {
                debug!(bucket = %bucket, "creating object store bucket");
                self.jetstream
                    .create_object_store(object_store::Config {
                        bucket: bucket.to_string(),
                        description: Some("Retention archives".to_string()),
                        ..Default::default()
                    })
                    .await
                    .context("failed to create object store bucket")
            }
        }
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub async fn close(self) {
        info!("Closing NATS connection");
        // Connection closes automatically when dropped
    }
}
