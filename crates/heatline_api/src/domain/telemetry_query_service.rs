use common::auth::{is_device_token, mask_device_id, DeviceTokenizer};
use common::domain::{
    aggregate_device_buckets, CallerScope, Device, DeviceFilter, DeviceRepository, DomainError,
    DomainResult, LatestState, SeriesBucket, SeriesMetric, SeriesQuery, TelemetryRepository,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Devices per latest-state query
pub const LATEST_BATCH_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LatestBatchRequest {
    /// Sealed device tokens; admins may also pass raw device IDs
    #[garde(length(min = 1, max = 500))]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestBatchItem {
    /// Raw for admins, masked for tenants
    pub device_id: String,
    /// Sealed token the caller can pass back on later requests
    pub lookup: String,
    pub profile_id: String,
    pub latest: Option<LatestState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestBatch {
    pub items: Vec<LatestBatchItem>,
    /// References that did not resolve to a device visible to the caller
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesScope {
    Device,
    Fleet,
}

impl SeriesScope {
    pub fn parse(value: &str) -> DomainResult<Self> {
        match value {
            "device" => Ok(SeriesScope::Device),
            "fleet" => Ok(SeriesScope::Fleet),
            other => Err(DomainError::ValidationError(format!(
                "scope: expected 'device' or 'fleet', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRequest {
    pub scope: SeriesScope,
    /// Device reference, required for device scope
    pub device: Option<String>,
    pub metrics: Vec<SeriesMetric>,
    pub interval_ms: i64,
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesResponse {
    pub interval_ms: i64,
    pub scope: SeriesScope,
    pub series: Vec<SeriesBucket>,
}

/// Read side of telemetry, scoped by the caller
///
/// Device references from callers are sealed tokens (or raw IDs for admins).
/// Visibility is re-checked against the stored device row on every call, so a
/// token alone never grants access.
pub struct TelemetryQueryService {
    device_repository: Arc<dyn DeviceRepository>,
    telemetry_repository: Arc<dyn TelemetryRepository>,
    tokenizer: Arc<DeviceTokenizer>,
}

impl TelemetryQueryService {
    pub fn new(
        device_repository: Arc<dyn DeviceRepository>,
        telemetry_repository: Arc<dyn TelemetryRepository>,
        tokenizer: Arc<DeviceTokenizer>,
    ) -> Self {
        Self {
            device_repository,
            telemetry_repository,
            tokenizer,
        }
    }

    #[instrument(skip(self, request), fields(admin = scope.is_admin(), requested = request.devices.len()))]
    pub async fn latest_batch(
        &self,
        scope: &CallerScope,
        request: LatestBatchRequest,
    ) -> DomainResult<LatestBatch> {
        common::garde::validate_struct(&request)?;

        let mut batch = LatestBatch::default();
        let mut resolved = Vec::with_capacity(request.devices.len());
        for reference in request.devices {
            match self.resolve_reference(scope, &reference) {
                Some(device_id) => resolved.push((reference, device_id)),
                None => batch.missing.push(reference),
            }
        }

        let mut lookup_ids: Vec<String> = resolved.iter().map(|(_, id)| id.clone()).collect();
        lookup_ids.sort();
        lookup_ids.dedup();

        let devices: HashMap<String, Device> = if lookup_ids.is_empty() {
            HashMap::new()
        } else {
            self.device_repository
                .get_devices(&lookup_ids)
                .await?
                .into_iter()
                .map(|device| (device.device_id.clone(), device))
                .collect()
        };

        let mut visible: Vec<&Device> = Vec::new();
        let mut seen = HashSet::new();
        for (reference, device_id) in &resolved {
            match devices.get(device_id) {
                Some(device) if scope.can_see(&device.profile_id) => {
                    if seen.insert(device_id.as_str()) {
                        visible.push(device);
                    }
                }
                _ => batch.missing.push(reference.clone()),
            }
        }

        let visible_ids: Vec<String> = visible.iter().map(|d| d.device_id.clone()).collect();
        let mut latest: HashMap<String, LatestState> = HashMap::new();
        for chunk in visible_ids.chunks(LATEST_BATCH_CHUNK_SIZE) {
            for state in self.telemetry_repository.get_latest_states(chunk).await? {
                latest.insert(state.device_id.clone(), state);
            }
        }

        for device in visible {
            batch.items.push(LatestBatchItem {
                device_id: display_id(scope, &device.device_id),
                lookup: self.tokenizer.seal(&device.device_id)?,
                profile_id: device.profile_id.clone(),
                latest: latest.remove(&device.device_id),
            });
        }

        debug!(
            items = batch.items.len(),
            missing = batch.missing.len(),
            "latest batch resolved"
        );

        Ok(batch)
    }

    #[instrument(skip(self, request), fields(admin = scope.is_admin(), series_scope = ?request.scope, interval_ms = request.interval_ms))]
    pub async fn series(
        &self,
        scope: &CallerScope,
        request: SeriesRequest,
    ) -> DomainResult<SeriesResponse> {
        let filter = match request.scope {
            SeriesScope::Device => {
                let reference = request
                    .device
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| {
                        DomainError::ValidationError("device: required for device scope".to_string())
                    })?;
                let device = self.visible_device(scope, reference).await?;
                DeviceFilter::Devices(vec![device.device_id])
            }
            SeriesScope::Fleet => scope.fleet_filter(),
        };

        let query = SeriesQuery {
            filter,
            metrics: request.metrics,
            start_ms: request.start_ms,
            end_ms: request.end_ms,
            interval_ms: request.interval_ms,
        };
        query.validate_window()?;

        let mut response = SeriesResponse {
            interval_ms: query.interval_ms,
            scope: request.scope,
            series: Vec::new(),
        };

        if matches!(&query.filter, DeviceFilter::Profiles(profiles) if profiles.is_empty()) {
            debug!("tenant owns no profiles, returning empty series");
            return Ok(response);
        }

        let stats = self
            .telemetry_repository
            .get_device_bucket_stats(&query)
            .await?;
        response.series = aggregate_device_buckets(stats);

        debug!(buckets = response.series.len(), "series aggregated");
        Ok(response)
    }

    /// Map a caller-supplied reference to a device ID. Raw IDs are only
    /// accepted from admins.
    fn resolve_reference(&self, scope: &CallerScope, reference: &str) -> Option<String> {
        if is_device_token(reference) {
            self.tokenizer.unseal(reference)
        } else if scope.is_admin() && !reference.is_empty() {
            Some(reference.to_string())
        } else {
            None
        }
    }

    /// Not-found and not-visible produce the same error
    async fn visible_device(&self, scope: &CallerScope, reference: &str) -> DomainResult<Device> {
        let not_found = || DomainError::DeviceNotFound(reference.to_string());

        let device_id = self
            .resolve_reference(scope, reference)
            .ok_or_else(not_found)?;

        self.device_repository
            .get_device(&device_id)
            .await?
            .filter(|device| scope.can_see(&device.profile_id))
            .ok_or_else(not_found)
    }
}

fn display_id(scope: &CallerScope, device_id: &str) -> String {
    if scope.is_admin() {
        device_id.to_string()
    } else {
        mask_device_id(device_id)
    }
}
