mod derived_metrics;
mod device;
mod nonce;
mod ops_metrics;
mod rate_limit;
mod result;
mod retention;
mod scope;
mod series;
mod telemetry;

pub use derived_metrics::*;
pub use device::*;
pub use nonce::*;
pub use ops_metrics::*;
pub use rate_limit::*;
pub use result::*;
pub use retention::*;
pub use scope::*;
pub use series::*;
pub use telemetry::*;
