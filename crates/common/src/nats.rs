mod archive_store;
mod client;
mod kv_bucket_store;

pub use archive_store::*;
pub use client::*;
pub use kv_bucket_store::*;
