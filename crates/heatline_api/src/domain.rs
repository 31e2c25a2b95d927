mod device_authenticator;
mod rate_limiter;
mod telemetry_ingestion_service;
mod telemetry_query_service;

pub use device_authenticator::*;
pub use rate_limiter::*;
pub use telemetry_ingestion_service::*;
pub use telemetry_query_service::*;
