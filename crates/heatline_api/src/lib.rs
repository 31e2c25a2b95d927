pub mod domain;
pub mod heatline_api;
pub mod http;

pub use domain::*;
pub use heatline_api::*;
pub use http::*;
