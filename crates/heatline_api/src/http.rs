mod ingest_handler;
mod server;
mod telemetry_handler;

pub use ingest_handler::*;
pub use server::*;
pub use telemetry_handler::*;
