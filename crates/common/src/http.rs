mod client_ip;
mod error;
mod logging;
mod origin;
mod server;

pub use client_ip::*;
pub use error::*;
pub use logging::*;
pub use origin::*;
pub use server::*;
