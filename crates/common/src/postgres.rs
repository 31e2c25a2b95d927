mod client;
mod config;
mod device_repository;
mod job_cursor_repository;
mod nonce_repository;
mod ops_metrics_repository;
mod retention_repository;
mod schema;
mod telemetry_repository;

pub use client::*;
pub use config::*;
pub use device_repository::*;
pub use job_cursor_repository::*;
pub use nonce_repository::*;
pub use ops_metrics_repository::*;
pub use retention_repository::*;
pub use schema::*;
pub use telemetry_repository::*;
