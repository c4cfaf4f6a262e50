//! Agriculture monitoring core: sensor ingest, irrigation control,
//! per-key rate limiting and the query layer behind the `/v1` REST API.

pub mod batching;
pub mod config;
pub mod db;
pub mod errors;
pub mod external;
pub mod ingest;
pub mod irrigation;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod query;
pub mod ratelimit;
pub mod registry;
pub mod rest;
pub mod validate;

pub use config::Config;
pub use errors::{Error, Result};
pub use ingest::SensorPipeline;
pub use irrigation::IrrigationController;
pub use ratelimit::{RateLimiter, Tier};
pub use registry::SensorCatalog;
pub use rest::{create_router, AppState};
