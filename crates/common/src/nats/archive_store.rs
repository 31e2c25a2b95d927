use crate::domain::{ArchiveStore, ArchiveTags, DomainError, DomainResult};
use async_nats::jetstream::object_store::{ObjectMetadata, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// `ArchiveStore` backed by a NATS JetStream object store bucket
#[derive(Clone)]
pub struct NatsArchiveStore {
    store: ObjectStore,
}

impl NatsArchiveStore {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArchiveStore for NatsArchiveStore {
    #[instrument(skip(self, body, tags), fields(size = body.len(), job_id = %tags.job_id))]
    async fn put_batch(&self, key: &str, body: Bytes, tags: &ArchiveTags) -> DomainResult<()> {
        let metadata = HashMap::from([
            ("cutoff".to_string(), tags.cutoff.to_rfc3339()),
            ("job_id".to_string(), tags.job_id.clone()),
        ]);
        let meta = ObjectMetadata {
            name: key.to_string(),
            description: Some("retention archive batch".to_string()),
            metadata,
            ..Default::default()
        };

        let mut reader = &body[..];
        self.store
            .put(meta, &mut reader)
            .await
            .map_err(|e| DomainError::ArchiveError(format!("failed to store {}: {}", key, e)))?;

        debug!("archived batch");
        Ok(())
    }
}
