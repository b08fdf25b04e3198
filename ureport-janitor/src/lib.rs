pub mod config;
pub mod janitor;
pub mod metrics_constants;
