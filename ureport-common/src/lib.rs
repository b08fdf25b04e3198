pub mod fingerprint;
pub mod matcher;
pub mod metrics;
pub mod metrics_consts;
pub mod report;
pub mod retry;
pub mod similarity;
pub mod spool;
pub mod store;
pub mod test_utils;
