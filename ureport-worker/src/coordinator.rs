use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use ureport_common::fingerprint::Fingerprinter;
use ureport_common::matcher::{ClusterRef, MatchKind, Matcher};
use ureport_common::metrics_consts::*;
use ureport_common::report::ReportParser;
use ureport_common::retry::RetryPolicy;
use ureport_common::spool::{
    deadline_after, ArchiveCause, ArchiveReason, Claim, Claimable, Spool, SpoolError, Transition,
};

use crate::error::{PipelineError, ProcessingError};

/// Where a claimed report ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Saved {
        cluster: ClusterRef,
    },
    Deferred {
        failed_attempts: u32,
        eligible_at: DateTime<Utc>,
    },
    Archived {
        cause: ArchiveCause,
    },
    /// Another worker or the stall reclaimer moved the entry first.
    ClaimLost,
    /// The spool itself failed. The entry stays where it was and stall recovery picks it up.
    Failed,
}

impl ReportOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Saved { .. } => "saved",
            ReportOutcome::Deferred { .. } => "deferred",
            ReportOutcome::Archived { .. } => "archived",
            ReportOutcome::ClaimLost => "claim_lost",
            ReportOutcome::Failed => "failed",
        }
    }
}

/// Drives one report at a time through the spool states: claim it, parse, fingerprint and
/// cluster it, then commit the result with a single rename.
pub struct SpoolCoordinator {
    spool: Spool,
    parser: ReportParser,
    fingerprinter: Fingerprinter,
    matcher: Matcher,
    retry_policy: RetryPolicy,
}

impl SpoolCoordinator {
    pub fn new(
        spool: Spool,
        parser: ReportParser,
        fingerprinter: Fingerprinter,
        matcher: Matcher,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            spool,
            parser,
            fingerprinter,
            matcher,
            retry_policy,
        }
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Fails when the spool root or the cluster store cannot be used at all.
    pub async fn check(&self) -> Result<(), PipelineError> {
        self.spool.check().await?;
        self.matcher.ping().await?;
        Ok(())
    }

    /// Claim and process one report. Never fails, every problem becomes an outcome.
    pub async fn handle(&self, candidate: &Claimable) -> ReportOutcome {
        let claim = match self.spool.claim(candidate, Utc::now()).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                metrics::counter!(CLAIMS_LOST).increment(1);
                return ReportOutcome::ClaimLost;
            }
            Err(e) => {
                error!(report = %candidate.id(), error = %e, "failed to claim report");
                metrics::counter!(REPORT_ERRORS).increment(1);
                return ReportOutcome::Failed;
            }
        };
        metrics::counter!(REPORTS_CLAIMED).increment(1);

        self.process(claim).await
    }

    pub async fn process(&self, claim: Claim) -> ReportOutcome {
        let start = Instant::now();

        let outcome = match self.cluster(&claim).await {
            Ok(cluster) => {
                let transition = self.spool.save(&claim).await;
                self.commit(&claim, transition, ReportOutcome::Saved { cluster })
            }
            Err(ProcessingError::Rejected(rejection)) => {
                warn!(report = %claim.id, error = %rejection, "archiving rejected report");
                let reason = ArchiveReason::rejected(&rejection, claim.failed_attempts, Utc::now());
                self.archive(&claim, reason).await
            }
            Err(error) => self.retry_later(&claim, &error).await,
        };

        metrics::histogram!(REPORT_PROCESSING_TIME, "outcome" => outcome.as_str())
            .record(start.elapsed().as_secs_f64());
        outcome
    }

    async fn cluster(&self, claim: &Claim) -> Result<ClusterRef, ProcessingError> {
        let raw = self
            .spool
            .read(claim)
            .await
            .map_err(ProcessingError::Read)?;
        let report = self.parser.parse(&raw)?;
        let fingerprint = self.fingerprinter.fingerprint(&report);

        // A stalled or failed attempt may have attached the report before losing its claim
        if claim.failed_attempts > 0 {
            if let Some(cluster_id) = self.matcher.attached_cluster(&claim.id).await? {
                debug!(report = %claim.id, cluster = %cluster_id, "already attached by an earlier attempt");
                return Ok(ClusterRef {
                    cluster_id,
                    kind: MatchKind::Exact,
                });
            }
        }

        let cluster = self
            .matcher
            .resolve(&fingerprint, &report, claim.arrived_at)
            .await?;
        self.matcher
            .attach(&cluster, &claim.id, &fingerprint, &report, claim.arrived_at)
            .await?;

        debug!(
            report = %claim.id,
            cluster = %cluster.cluster_id,
            kind = cluster.kind.as_str(),
            fallback = fingerprint.is_fallback(),
            "report clustered"
        );
        Ok(cluster)
    }

    async fn retry_later(&self, claim: &Claim, error: &ProcessingError) -> ReportOutcome {
        let failed_attempts = claim.failed_attempts + 1;
        let now = Utc::now();

        if self.retry_policy.is_exhausted(failed_attempts) {
            warn!(report = %claim.id, failed_attempts, error = %error, "retries exhausted, archiving report");
            let reason = ArchiveReason::exhausted(failed_attempts, &error.to_string(), now);
            return self.archive(claim, reason).await;
        }

        let interval = self.retry_policy.retry_interval(failed_attempts);
        let eligible_at = deadline_after(now, interval);

        info!(
            report = %claim.id,
            failed_attempts,
            eligible_at = %eligible_at,
            error = %error,
            "deferring report"
        );
        let transition = self.spool.defer(claim, failed_attempts, eligible_at).await;
        self.commit(
            claim,
            transition,
            ReportOutcome::Deferred {
                failed_attempts,
                eligible_at,
            },
        )
    }

    async fn archive(&self, claim: &Claim, reason: ArchiveReason) -> ReportOutcome {
        let cause = reason.cause;
        let transition = self.spool.archive(claim, &reason).await;
        self.commit(claim, transition, ReportOutcome::Archived { cause })
    }

    fn commit(
        &self,
        claim: &Claim,
        transition: Result<Transition, SpoolError>,
        outcome: ReportOutcome,
    ) -> ReportOutcome {
        match transition {
            Ok(Transition::Moved) => {}
            Ok(Transition::Lost) => {
                warn!(report = %claim.id, "claim was reclaimed while the report was processed");
                metrics::counter!(CLAIMS_LOST).increment(1);
                return ReportOutcome::ClaimLost;
            }
            Err(e) => {
                error!(report = %claim.id, error = %e, "failed to commit report");
                metrics::counter!(REPORT_ERRORS).increment(1);
                return ReportOutcome::Failed;
            }
        }

        match &outcome {
            ReportOutcome::Saved { cluster } => {
                metrics::counter!(REPORTS_SAVED, "kind" => cluster.kind.as_str()).increment(1);
            }
            ReportOutcome::Deferred { .. } => {
                metrics::counter!(REPORTS_DEFERRED).increment(1);
            }
            ReportOutcome::Archived { cause } => {
                metrics::counter!(REPORTS_ARCHIVED, "cause" => cause.as_str()).increment(1);
            }
            ReportOutcome::ClaimLost | ReportOutcome::Failed => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use ureport_common::similarity::LcsSimilarity;
    use ureport_common::spool::SpoolState;
    use ureport_common::store::{ClusterStore, MemoryClusterStore};
    use ureport_common::test_utils::{core_v1_report, python_v2_report, FlakyStore};

    use super::*;

    async fn coordinator(
        store: Arc<dyn ClusterStore>,
        max_attempts: u32,
    ) -> (tempfile::TempDir, SpoolCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool.init().await.unwrap();

        let matcher = Matcher::new(
            store,
            Arc::new(LcsSimilarity::default()),
            10,
            Duration::from_millis(200),
        );
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(60))
            .max_attempts(max_attempts)
            .provide();
        let coordinator = SpoolCoordinator::new(
            spool,
            ReportParser::default(),
            Fingerprinter::default(),
            matcher,
            retry_policy,
        );
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_valid_report_is_saved() {
        let store = Arc::new(MemoryClusterStore::new());
        let (_dir, coordinator) = coordinator(store.clone(), 3).await;
        let body = python_v2_report("will-crash", "0.1", "ZeroDivisionError").to_string();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();

        let outcome = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;

        let ReportOutcome::Saved { cluster } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(cluster.kind, MatchKind::Created);
        assert_eq!(
            coordinator.spool().locate("r1").await.unwrap(),
            vec![SpoolState::Saved]
        );
        assert_eq!(store.reports_of(cluster.cluster_id).await, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_malformed_report_is_archived_with_reason() {
        let store = Arc::new(MemoryClusterStore::new());
        let (_dir, coordinator) = coordinator(store.clone(), 3).await;
        coordinator.spool().deposit("r1", b"{\"type\": ").await.unwrap();

        let outcome = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;

        assert_eq!(
            outcome,
            ReportOutcome::Archived {
                cause: ArchiveCause::MalformedReport
            }
        );
        let reason = coordinator
            .spool()
            .archive_reason("r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason.cause, ArchiveCause::MalformedReport);
        assert_eq!(reason.failed_attempts, 0);
        assert!(store.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_version_is_archived() {
        let store = Arc::new(MemoryClusterStore::new());
        let (_dir, coordinator) = coordinator(store, 3).await;
        let body = json!({"ureport_version": 7}).to_string();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();

        let outcome = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;

        assert_eq!(
            outcome,
            ReportOutcome::Archived {
                cause: ArchiveCause::UnsupportedFormat
            }
        );
    }

    #[tokio::test]
    async fn test_storage_failure_defers_then_archives() {
        let memory = Arc::new(MemoryClusterStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let (_dir, coordinator) = coordinator(flaky.clone(), 1).await;
        let body = core_v1_report("foo", "1.2", 10).to_string();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();

        flaky.set_down(true);
        let before = Utc::now();
        let outcome = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;
        let ReportOutcome::Deferred {
            failed_attempts,
            eligible_at,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(failed_attempts, 1);
        assert!(eligible_at >= before + chrono::Duration::seconds(60));
        assert!(memory.clusters().await.is_empty());

        // budget of one deferred cycle, so the next failure archives
        let deferred = coordinator.spool().claimable(eligible_at).await.unwrap();
        assert_eq!(deferred.len(), 1);
        let outcome = coordinator.handle(&deferred[0]).await;
        assert_eq!(
            outcome,
            ReportOutcome::Archived {
                cause: ArchiveCause::ExhaustedRetries
            }
        );
        let reason = coordinator
            .spool()
            .archive_reason("r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason.failed_attempts, 2);
        assert!(reason.message.contains("exhausted retries"));
    }

    #[tokio::test]
    async fn test_storage_timeout_defers() {
        let memory = Arc::new(MemoryClusterStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let (_dir, coordinator) = coordinator(flaky.clone(), 3).await;
        let body = core_v1_report("foo", "1.2", 10).to_string();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();

        flaky.stall(true);
        let outcome = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;

        assert!(matches!(
            outcome,
            ReportOutcome::Deferred {
                failed_attempts: 1,
                ..
            }
        ));
        assert!(memory.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_claim_is_silent() {
        let store = Arc::new(MemoryClusterStore::new());
        let (_dir, coordinator) = coordinator(store, 3).await;

        let outcome = coordinator
            .handle(&Claimable::Incoming("missing".to_owned()))
            .await;

        assert_eq!(outcome, ReportOutcome::ClaimLost);
    }

    #[tokio::test]
    async fn test_retry_after_attach_keeps_the_cluster() {
        let memory = Arc::new(MemoryClusterStore::new());
        let (_dir, coordinator) = coordinator(memory.clone(), 3).await;
        let body = core_v1_report("foo", "1.2", 10).to_string();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();

        let first = coordinator
            .handle(&Claimable::Incoming("r1".to_owned()))
            .await;
        let ReportOutcome::Saved { cluster } = first else {
            panic!("unexpected outcome {first:?}");
        };

        // the same identity coming back deferred, as if the save rename never happened
        let now = Utc::now();
        coordinator.spool().deposit("r1", body.as_bytes()).await.unwrap();
        let claim = coordinator
            .spool()
            .claim(&Claimable::Incoming("r1".to_owned()), now)
            .await
            .unwrap()
            .unwrap();
        coordinator.spool().defer(&claim, 1, now).await.unwrap();
        let retry = coordinator.spool().claimable(now).await.unwrap();
        assert_eq!(retry[0].failed_attempts(), 1);
        let second = coordinator.handle(&retry[0]).await;

        assert_eq!(
            second,
            ReportOutcome::Saved {
                cluster: ClusterRef {
                    cluster_id: cluster.cluster_id,
                    kind: MatchKind::Exact
                }
            }
        );
        let clusters = memory.clusters().await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].report_count, 1);
    }

    #[tokio::test]
    async fn test_huge_backoff_is_capped() {
        let memory = Arc::new(MemoryClusterStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool.init().await.unwrap();
        let matcher = Matcher::new(
            flaky.clone(),
            Arc::new(LcsSimilarity::default()),
            10,
            Duration::from_millis(200),
        );
        // a day doubled forty times is far past the end of the calendar
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(86_400))
            .max_attempts(100)
            .provide();
        let coordinator = SpoolCoordinator::new(
            spool.clone(),
            ReportParser::default(),
            Fingerprinter::default(),
            matcher,
            retry_policy,
        );

        let now = Utc::now();
        let body = core_v1_report("foo", "1.2", 4).to_string();
        spool.deposit("r1", body.as_bytes()).await.unwrap();
        let claim = spool
            .claim(&Claimable::Incoming("r1".to_owned()), now)
            .await
            .unwrap()
            .unwrap();
        spool.defer(&claim, 40, now).await.unwrap();

        flaky.set_down(true);
        let retry = spool.claimable(now).await.unwrap();
        let outcome = coordinator.handle(&retry[0]).await;

        let ReportOutcome::Deferred {
            failed_attempts,
            eligible_at,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(failed_attempts, 41);
        assert!(eligible_at > now + chrono::Duration::days(365));
        assert!(eligible_at <= Utc::now() + chrono::Duration::days(36_500));
        assert_eq!(spool.locate("r1").await.unwrap(), vec![SpoolState::Deferred]);
    }
}
