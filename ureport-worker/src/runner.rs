use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use health::{ComponentStatus, HealthHandle};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ureport_common::metrics::record_spool_depths;
use ureport_common::metrics_consts::*;

use crate::coordinator::{ReportOutcome, SpoolCoordinator};
use crate::error::PipelineError;

/// Counts of one run. `processed` covers the reports this run claimed, entries recovered
/// before claiming are counted in `reclaimed`, `exhausted` and `unclaimable` only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub processed: usize,
    pub saved: usize,
    pub deferred: usize,
    pub archived: usize,
    pub errors: usize,
    /// Claims lost to another worker.
    pub skipped: usize,
    /// Stalled processing entries moved to deferred or archive.
    pub reclaimed: usize,
    /// Deferred entries archived because they were already over the retry budget.
    pub exhausted: usize,
    /// Incoming entries archived because their names cannot be identities.
    pub unclaimable: usize,
    /// Entries recovery could not move. They stay where they are for the next run.
    pub recovery_errors: usize,
}

impl Summary {
    fn record(&mut self, outcome: &ReportOutcome) {
        match outcome {
            ReportOutcome::Saved { .. } => self.saved += 1,
            ReportOutcome::Deferred { .. } => self.deferred += 1,
            ReportOutcome::Archived { .. } => self.archived += 1,
            ReportOutcome::Failed => self.errors += 1,
            ReportOutcome::ClaimLost => {
                self.skipped += 1;
                return;
            }
        }
        self.processed += 1;
    }
}

/// Runs passes over the spool. Any number of runners, in this process or others, may share
/// a spool root and a cluster store.
pub struct PipelineRunner {
    coordinator: Arc<SpoolCoordinator>,
    /// Claims older than this are considered stalled.
    liveness_timeout: Duration,
    /// Most entries to claim in a single run.
    limit: Option<usize>,
    cancel: CancellationToken,
}

impl PipelineRunner {
    pub fn new(coordinator: Arc<SpoolCoordinator>, liveness_timeout: Duration) -> Self {
        Self {
            coordinator,
            liveness_timeout,
            limit: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One pass over the spool with up to `concurrency` reports in flight. Only setup
    /// failures are errors, individual reports always settle into an outcome.
    pub async fn run_once(&self, concurrency: usize) -> Result<Summary, PipelineError> {
        let start = Instant::now();
        self.coordinator.check().await?;

        let spool = self.coordinator.spool();
        let policy = self.coordinator.retry_policy();
        let now = Utc::now();

        // Only listing a state directory can fail here, a single bad entry is counted
        let reclaimed = spool
            .reclaim_stalled(self.liveness_timeout, policy, now)
            .await?;
        let exhausted = spool.archive_exhausted(policy, now).await?;
        let unclaimable = spool.archive_unclaimable(now).await?;

        let mut candidates = spool.claimable(now).await?;
        if let Some(limit) = self.limit {
            candidates.truncate(limit);
        }

        let mut summary = Summary {
            reclaimed: reclaimed.deferred + reclaimed.archived,
            exhausted: exhausted.archived,
            unclaimable: unclaimable.archived,
            recovery_errors: reclaimed.errors + exhausted.errors + unclaimable.errors,
            ..Summary::default()
        };

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for candidate in candidates {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("run cancelled, not claiming any more reports");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore has been closed")
                }
            };

            let coordinator = self.coordinator.clone();
            tasks.spawn(async move {
                let outcome = coordinator.handle(&candidate).await;
                drop(permit);
                outcome
            });
        }

        // In-flight reports settle even after cancellation
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!(error = %e, "report task failed");
                    summary.record(&ReportOutcome::Failed);
                }
            }
        }

        let elapsed = start.elapsed();
        metrics::counter!(RUNS_COMPLETED).increment(1);
        metrics::histogram!(RUN_DURATION).record(elapsed.as_secs_f64());
        metrics::counter!(STALLED_RECLAIMED).increment(summary.reclaimed as u64);
        metrics::counter!(UNCLAIMABLE_ARCHIVED).increment(summary.unclaimable as u64);
        metrics::counter!(RECOVERY_ERRORS).increment(summary.recovery_errors as u64);
        match spool.depths().await {
            Ok(depths) => record_spool_depths(&depths),
            Err(e) => warn!(error = %e, "could not measure spool depths"),
        }

        info!(
            processed = summary.processed,
            saved = summary.saved,
            deferred = summary.deferred,
            archived = summary.archived,
            errors = summary.errors,
            skipped = summary.skipped,
            reclaimed = summary.reclaimed,
            exhausted = summary.exhausted,
            unclaimable = summary.unclaimable,
            recovery_errors = summary.recovery_errors,
            duration_ms = elapsed.as_millis() as u64,
            "pipeline run complete"
        );

        Ok(summary)
    }

    /// Run every `poll_interval` until cancelled. A failed setup check marks the process
    /// unready and is retried on the next tick.
    pub async fn run(
        &self,
        concurrency: usize,
        poll_interval: Duration,
        liveness: HealthHandle,
        readiness: HealthHandle,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            liveness.report_healthy();

            match self.run_once(concurrency).await {
                Ok(_) => readiness.report_healthy(),
                Err(e) => {
                    error!(error = %e, "pipeline run aborted");
                    readiness.report_status(ComponentStatus::Unhealthy);
                }
            }
        }

        info!("pipeline runner stopped");
    }
}
