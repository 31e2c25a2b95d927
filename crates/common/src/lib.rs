pub mod auth;
pub mod domain;
pub mod garde;
pub mod http;
pub mod nats;
pub mod postgres;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockArchiveStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockBucketStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockJobCursorStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockNonceRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockOpsMetricsRecorder;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockRetentionRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockTelemetryRepository;
