pub mod domain;
pub mod retention_worker;

pub use domain::*;
pub use retention_worker::*;
