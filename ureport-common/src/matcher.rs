use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::metrics_consts::{CLUSTERS_CREATED, CLUSTER_MATCHES, STORE_TIMEOUTS};
use crate::report::StructuredReport;
use crate::similarity::SimilarityPolicy;
use crate::store::{
    report_stats, AppendOutcome, ClusterMember, ClusterStore, NewCluster, StoreError,
};

pub const DEFAULT_MAX_CANDIDATES: usize = 50;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchKind {
    Exact,
    Approximate { score: f64 },
    Created,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Approximate { .. } => "approximate",
            MatchKind::Created => "created",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterRef {
    pub cluster_id: Uuid,
    pub kind: MatchKind,
}

/// Decides which cluster a report belongs to. Holds no cluster state of its own, every
/// decision goes through the store so that concurrent matchers agree.
pub struct Matcher {
    store: Arc<dyn ClusterStore>,
    policy: Arc<dyn SimilarityPolicy>,
    max_candidates: usize,
    storage_timeout: Duration,
}

impl Matcher {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        policy: Arc<dyn SimilarityPolicy>,
        max_candidates: usize,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            max_candidates,
            storage_timeout,
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, MatchError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.storage_timeout, op).await {
            Ok(res) => Ok(res?),
            Err(_) => {
                metrics::counter!(STORE_TIMEOUTS).increment(1);
                Err(StoreError::Timeout(self.storage_timeout).into())
            }
        }
    }

    pub async fn resolve(
        &self,
        fingerprint: &Fingerprint,
        report: &StructuredReport,
        seen_at: DateTime<Utc>,
    ) -> Result<ClusterRef, MatchError> {
        if let Some(cluster) = self
            .bounded(self.store.find_by_fingerprint(&fingerprint.value))
            .await?
        {
            metrics::counter!(CLUSTER_MATCHES, "kind" => "exact").increment(1);
            return Ok(ClusterRef {
                cluster_id: cluster.id,
                kind: MatchKind::Exact,
            });
        }

        if !fingerprint.is_fallback() && report.backtrace.is_available() {
            if let Some(found) = self.approximate(fingerprint).await? {
                metrics::counter!(CLUSTER_MATCHES, "kind" => "approximate").increment(1);
                return Ok(found);
            }
        }

        let outcome = self
            .bounded(
                self.store
                    .create_if_absent(NewCluster::from_fingerprint(fingerprint, seen_at)),
            )
            .await?;

        if outcome.created {
            metrics::counter!(CLUSTERS_CREATED).increment(1);
            info!(
                cluster = %outcome.cluster.id,
                component = %fingerprint.component,
                crash_type = %fingerprint.crash_type,
                "created problem cluster"
            );
            Ok(ClusterRef {
                cluster_id: outcome.cluster.id,
                kind: MatchKind::Created,
            })
        } else {
            // Lost the create race, which makes it an exact match after all
            metrics::counter!(CLUSTER_MATCHES, "kind" => "exact").increment(1);
            Ok(ClusterRef {
                cluster_id: outcome.cluster.id,
                kind: MatchKind::Exact,
            })
        }
    }

    async fn approximate(&self, fingerprint: &Fingerprint) -> Result<Option<ClusterRef>, MatchError> {
        let candidates = self
            .bounded(self.store.candidates(
                &fingerprint.component,
                &fingerprint.crash_type,
                self.max_candidates,
            ))
            .await?;

        // Highest score wins, then the most recently active cluster
        let best = candidates
            .iter()
            .filter(|c| c.has_backtrace)
            .filter_map(|c| {
                self.policy
                    .matches(&fingerprint.frames, &c.frames)
                    .map(|score| (score, c))
            })
            .max_by(|(sa, a), (sb, b)| {
                sa.total_cmp(sb)
                    .then(a.last_seen.cmp(&b.last_seen))
                    .then(b.id.cmp(&a.id))
            });

        let Some((score, cluster)) = best else {
            debug!(
                candidates = candidates.len(),
                policy = self.policy.name(),
                "no similar cluster"
            );
            return Ok(None);
        };

        // Later reports with this exact fingerprint then take the fast path. If somebody
        // linked it first, their decision stands.
        let cluster_id = self
            .bounded(self.store.link_fingerprint(&fingerprint.value, cluster.id))
            .await?;

        debug!(cluster = %cluster_id, score, policy = self.policy.name(), "similar cluster");
        Ok(Some(ClusterRef {
            cluster_id,
            kind: if cluster_id == cluster.id {
                MatchKind::Approximate { score }
            } else {
                MatchKind::Exact
            },
        }))
    }

    /// Attach a report to its cluster and count its occurrence. Idempotent by report identity.
    pub async fn attach(
        &self,
        cluster: &ClusterRef,
        report_id: &str,
        fingerprint: &Fingerprint,
        report: &StructuredReport,
        seen_at: DateTime<Utc>,
    ) -> Result<AppendOutcome, MatchError> {
        self.bounded(self.store.append_report(
            cluster.cluster_id,
            ClusterMember {
                report_id: report_id.to_owned(),
                fingerprint: fingerprint.value.clone(),
                frames: fingerprint.frames.clone(),
                seen_at,
                stats: report_stats(report, seen_at),
            },
        ))
        .await
    }

    /// Whether a cluster already owns this exact fingerprint. Read only, creates nothing.
    pub async fn is_known(&self, fingerprint: &Fingerprint) -> Result<bool, MatchError> {
        Ok(self
            .bounded(self.store.find_by_fingerprint(&fingerprint.value))
            .await?
            .is_some())
    }

    /// The cluster a previous attempt already attached this report to.
    pub async fn attached_cluster(&self, report_id: &str) -> Result<Option<Uuid>, MatchError> {
        self.bounded(self.store.cluster_of_report(report_id)).await
    }

    pub async fn ping(&self) -> Result<(), MatchError> {
        self.bounded(self.store.ping()).await
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::fingerprint::Fingerprinter;
    use crate::report::ReportParser;
    use crate::similarity::LcsSimilarity;
    use crate::store::{MemoryClusterStore, Stat};
    use crate::test_utils::{core_v1_report, FlakyStore};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn matcher(store: Arc<dyn ClusterStore>) -> Matcher {
        Matcher::new(
            store,
            Arc::new(LcsSimilarity::default()),
            DEFAULT_MAX_CANDIDATES,
            TIMEOUT,
        )
    }

    fn parse(value: serde_json::Value) -> (StructuredReport, Fingerprint) {
        let report = ReportParser::default()
            .parse(value.to_string().as_bytes())
            .unwrap();
        let fingerprint = Fingerprinter::default().fingerprint(&report);
        (report, fingerprint)
    }

    /// `foo-1.2` SIGSEGV with ten frames, the first `shared` of them the same as the base
    fn variant(shared: usize) -> serde_json::Value {
        let mut value = core_v1_report("foo", "1.2", 10);
        for i in shared..10 {
            value["core_backtrace"][i]["funcname"] = json!(format!("other_{i}"));
        }
        value
    }

    async fn resolve_and_attach(
        matcher: &Matcher,
        value: serde_json::Value,
        report_id: &str,
    ) -> ClusterRef {
        let (report, fingerprint) = parse(value);
        let cluster = matcher
            .resolve(&fingerprint, &report, Utc::now())
            .await
            .unwrap();
        matcher
            .attach(&cluster, report_id, &fingerprint, &report, Utc::now())
            .await
            .unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_similar_backtraces_share_a_cluster() {
        let store = Arc::new(MemoryClusterStore::new());
        let matcher = matcher(store.clone());

        let first = resolve_and_attach(&matcher, variant(10), "r1").await;
        assert_eq!(first.kind, MatchKind::Created);

        let eight = resolve_and_attach(&matcher, variant(8), "r2").await;
        assert_eq!(eight.cluster_id, first.cluster_id);
        assert!(matches!(eight.kind, MatchKind::Approximate { .. }));

        let three = resolve_and_attach(&matcher, variant(3), "r3").await;
        assert_ne!(three.cluster_id, first.cluster_id);
        assert_eq!(three.kind, MatchKind::Created);

        // the approximate match linked its fingerprint
        let again = resolve_and_attach(&matcher, variant(8), "r4").await;
        assert_eq!(again.cluster_id, first.cluster_id);
        assert_eq!(again.kind, MatchKind::Exact);

        assert_eq!(store.clusters().await.len(), 2);
        assert_eq!(store.reports_of(first.cluster_id).await, vec!["r1", "r2", "r4"]);
    }

    #[tokio::test]
    async fn test_fallback_never_matches_approximately() {
        let store = Arc::new(MemoryClusterStore::new());
        let matcher = matcher(store.clone());

        resolve_and_attach(&matcher, variant(10), "r1").await;

        let mut no_backtrace = variant(10);
        no_backtrace.as_object_mut().unwrap().remove("core_backtrace");
        let fallback = resolve_and_attach(&matcher, no_backtrace.clone(), "r2").await;
        assert_eq!(fallback.kind, MatchKind::Created);

        let again = resolve_and_attach(&matcher, no_backtrace, "r3").await;
        assert_eq!(again.kind, MatchKind::Exact);
        assert_eq!(again.cluster_id, fallback.cluster_id);

        // fallback clusters are never offered as candidates
        let candidates = store.candidates("foo", "SIGSEGV", 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_best_candidate_wins() {
        let store = Arc::new(MemoryClusterStore::new());
        let matcher = matcher(store.clone());

        let nine = resolve_and_attach(&matcher, variant(9), "r1").await;
        // unrelated bug, same component and crash type
        let mut far = core_v1_report("foo", "1.2", 10);
        for i in 0..10 {
            far["core_backtrace"][i]["funcname"] = json!(format!("far_{i}"));
        }
        resolve_and_attach(&matcher, far, "r2").await;

        let exact_base = resolve_and_attach(&matcher, variant(10), "r3").await;
        assert_eq!(exact_base.cluster_id, nine.cluster_id);
    }

    #[tokio::test]
    async fn test_storage_errors_never_create_clusters() {
        let memory = Arc::new(MemoryClusterStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let matcher = matcher(flaky.clone());
        let (report, fingerprint) = parse(variant(10));

        flaky.fail_next(1);
        let res = matcher.resolve(&fingerprint, &report, Utc::now()).await;
        assert!(matches!(res, Err(MatchError::StorageUnavailable(_))));
        assert!(memory.clusters().await.is_empty());

        flaky.stall(true);
        let res = matcher.resolve(&fingerprint, &report, Utc::now()).await;
        assert!(matches!(
            res,
            Err(MatchError::StorageUnavailable(StoreError::Timeout(_)))
        ));
        assert!(memory.clusters().await.is_empty());

        flaky.stall(false);
        let res = matcher.resolve(&fingerprint, &report, Utc::now()).await;
        assert_eq!(res.unwrap().kind, MatchKind::Created);
    }

    #[tokio::test]
    async fn test_is_known_only_looks() {
        let store = Arc::new(MemoryClusterStore::new());
        let matcher = matcher(store.clone());
        let (_, fingerprint) = parse(variant(10));

        assert!(!matcher.is_known(&fingerprint).await.unwrap());
        assert!(store.clusters().await.is_empty());

        resolve_and_attach(&matcher, variant(10), "r1").await;
        assert!(matcher.is_known(&fingerprint).await.unwrap());

        // similar is not known, only the exact fingerprint counts
        let (_, similar) = parse(variant(8));
        assert!(!matcher.is_known(&similar).await.unwrap());
        assert_eq!(store.clusters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_counts_occurrences_once_per_report() {
        let store = Arc::new(MemoryClusterStore::new());
        let matcher = matcher(store.clone());

        let cluster = resolve_and_attach(&matcher, variant(10), "r1").await;
        resolve_and_attach(&matcher, variant(10), "r1").await;
        let mut arm = variant(10);
        arm["architecture"] = json!("aarch64");
        resolve_and_attach(&matcher, arm, "r2").await;

        let stats = store.cluster_stats(cluster.cluster_id).await.unwrap();
        let count = |stat: Stat, value: &str| {
            stats
                .iter()
                .find(|s| s.key.stat == stat && s.key.value == value)
                .map(|s| s.count)
        };
        assert_eq!(count(Stat::OsRelease, "Fedora 20"), Some(2));
        assert_eq!(count(Stat::Architecture, "x86_64"), Some(1));
        assert_eq!(count(Stat::Architecture, "aarch64"), Some(1));
        assert_eq!(count(Stat::Executable, "/usr/bin/foo"), Some(2));
        let today = Utc::now().date_naive().to_string();
        assert_eq!(count(Stat::Day, &today), Some(2));
    }
}
