use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use ureport_common::metrics::record_spool_depths;
use ureport_common::spool::{Spool, SpoolError};

use crate::{config::JanitorSettings, metrics_constants::*};

// The janitor reports its own metrics, this is mostly for testing purposes
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct CleanupResult {
    pub stalled_deferred: usize,
    pub stalled_archived: usize,
    pub exhausted_archived: usize,
    pub orphaned_reasons: usize,
    pub saved_purged: usize,
    /// Entries that could not be moved, left for the next pass
    pub recovery_errors: usize,
}

/// Housekeeping for a spool root shared with the workers. Every move it makes is a rename
/// racing the workers, and a lost race just means a worker got there first.
pub struct Janitor {
    pub spool: Spool,
    pub settings: JanitorSettings,
}

impl Janitor {
    pub fn new(spool: Spool, settings: JanitorSettings) -> Self {
        Self { spool, settings }
    }

    pub async fn run_once(&self) -> Result<CleanupResult, SpoolError> {
        info!("Running janitor loop");
        let start = Instant::now();
        let id = self.settings.id.clone();
        metrics::counter!(RUN_STARTS, "janitor_id" => id.clone()).increment(1);

        self.spool.check().await?;
        let now = Utc::now();
        let policy = &self.settings.retry_policy;

        let stalled = self
            .spool
            .reclaim_stalled(self.settings.liveness_timeout, policy, now)
            .await?;
        metrics::counter!(STALLED_COUNT, "janitor_id" => id.clone())
            .increment((stalled.deferred + stalled.archived) as u64);
        if stalled.deferred + stalled.archived > 0 {
            warn!(
                deferred = stalled.deferred,
                archived = stalled.archived,
                "Reclaimed stalled reports"
            );
        }

        let exhausted = self.spool.archive_exhausted(policy, now).await?;
        metrics::counter!(EXHAUSTED_COUNT, "janitor_id" => id.clone())
            .increment(exhausted.archived as u64);
        if exhausted.archived > 0 {
            warn!(
                "Archived {} deferred reports over the retry budget",
                exhausted.archived
            );
        }
        let recovery_errors = stalled.errors + exhausted.errors;
        metrics::counter!(RECOVERY_ERRORS_COUNT, "janitor_id" => id.clone())
            .increment(recovery_errors as u64);

        let orphaned = self
            .spool
            .remove_orphaned_reasons(self.settings.orphan_grace)
            .await?;
        metrics::counter!(ORPHANED_REASONS_COUNT, "janitor_id" => id.clone())
            .increment(orphaned as u64);

        let saved_purged = match self.settings.saved_retention {
            Some(retention) => self.spool.purge_saved(retention).await?,
            None => 0,
        };
        metrics::counter!(SAVED_PURGED_COUNT, "janitor_id" => id.clone())
            .increment(saved_purged as u64);

        record_spool_depths(&self.spool.depths().await?);

        metrics::histogram!(RUN_TIME, "janitor_id" => id.clone())
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(RUN_ENDS, "janitor_id" => id).increment(1);
        info!("Janitor loop complete");

        Ok(CleanupResult {
            stalled_deferred: stalled.deferred,
            stalled_archived: stalled.archived,
            exhausted_archived: exhausted.archived,
            orphaned_reasons: orphaned,
            saved_purged,
            recovery_errors,
        })
    }
}
