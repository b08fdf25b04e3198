pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod runner;
