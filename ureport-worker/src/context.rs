use std::sync::Arc;

use tracing::{info, warn};
use ureport_common::fingerprint::Fingerprinter;
use ureport_common::matcher::Matcher;
use ureport_common::report::ReportParser;
use ureport_common::similarity::build_policy;
use ureport_common::spool::Spool;
use ureport_common::store::{ClusterStore, MemoryClusterStore, PgClusterStore, StoreError};

use crate::config::{Config, StoreBackend};
use crate::coordinator::SpoolCoordinator;
use crate::runner::PipelineRunner;

pub async fn build_store(config: &Config) -> Result<Arc<dyn ClusterStore>, StoreError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PgClusterStore::new(
                &config.database_url,
                config.max_pg_connections,
                config.storage_timeout.0,
            )
            .await?;
            if config.run_migrations {
                info!("running cluster store migrations");
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using the in-memory cluster store, clusters will not survive a restart");
            Ok(Arc::new(MemoryClusterStore::new()))
        }
    }
}

pub fn build_coordinator(config: &Config, store: Arc<dyn ClusterStore>) -> SpoolCoordinator {
    let matching = &config.matching;
    let policy = build_policy(
        matching.similarity_algorithm,
        matching.similarity_frames,
        matching.similarity_threshold,
    );
    let matcher = Matcher::new(
        store,
        policy,
        matching.max_candidates,
        config.storage_timeout.0,
    );

    SpoolCoordinator::new(
        Spool::new(config.spool_root.as_str()),
        ReportParser::new(config.max_report_bytes),
        Fingerprinter::new(matching.hash_frames),
        matcher,
        config.retry_policy.provide(),
    )
}

pub fn build_runner(config: &Config, coordinator: SpoolCoordinator) -> PipelineRunner {
    PipelineRunner::new(Arc::new(coordinator), config.liveness_timeout.0).with_limit(config.limit())
}
