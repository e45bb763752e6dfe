pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod relay;
pub mod rewriter;
pub mod router;
pub mod telemetry;
pub mod usage_collector;

pub use error::{Error, Result};
