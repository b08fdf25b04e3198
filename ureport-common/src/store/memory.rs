use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AppendOutcome, ClusterMember, ClusterStore, CreateOutcome, NewCluster, ProblemCluster,
    StatCount, StatKey, StoreError,
};

#[derive(Default)]
struct State {
    clusters: HashMap<Uuid, ProblemCluster>,
    fingerprints: HashMap<String, Uuid>,
    reports: HashMap<String, Uuid>,
    stats: BTreeMap<(Uuid, StatKey), i64>,
}

/// Cluster store for a single process. The mutex plays the part of the unique constraints.
#[derive(Default)]
pub struct MemoryClusterStore {
    state: Mutex<State>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clusters(&self) -> Vec<ProblemCluster> {
        let state = self.state.lock().await;
        let mut clusters: Vec<_> = state.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.first_seen);
        clusters
    }

    pub async fn reports_of(&self, cluster_id: Uuid) -> Vec<String> {
        let state = self.state.lock().await;
        let mut reports: Vec<_> = state
            .reports
            .iter()
            .filter(|(_, id)| **id == cluster_id)
            .map(|(report, _)| report.clone())
            .collect();
        reports.sort();
        reports
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ProblemCluster>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fingerprints
            .get(fingerprint)
            .and_then(|id| state.clusters.get(id))
            .cloned())
    }

    async fn candidates(
        &self,
        component: &str,
        crash_type: &str,
        limit: usize,
    ) -> Result<Vec<ProblemCluster>, StoreError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<_> = state
            .clusters
            .values()
            .filter(|c| c.has_backtrace && c.component == component && c.crash_type == crash_type)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn create_if_absent(&self, cluster: NewCluster) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .fingerprints
            .get(&cluster.fingerprint)
            .and_then(|id| state.clusters.get(id))
        {
            return Ok(CreateOutcome {
                cluster: existing.clone(),
                created: false,
            });
        }

        let cluster = cluster.into_cluster(Uuid::now_v7());
        state
            .fingerprints
            .insert(cluster.fingerprint.clone(), cluster.id);
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(CreateOutcome {
            cluster,
            created: true,
        })
    }

    async fn link_fingerprint(
        &self,
        fingerprint: &str,
        cluster_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        if !state.clusters.contains_key(&cluster_id) {
            return Err(StoreError::MissingCluster(cluster_id));
        }
        Ok(*state
            .fingerprints
            .entry(fingerprint.to_owned())
            .or_insert(cluster_id))
    }

    async fn append_report(
        &self,
        cluster_id: Uuid,
        member: ClusterMember,
    ) -> Result<AppendOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if state.reports.contains_key(&member.report_id) {
            return Ok(AppendOutcome::AlreadyAttached);
        }

        let cluster = state
            .clusters
            .get_mut(&cluster_id)
            .ok_or(StoreError::MissingCluster(cluster_id))?;

        cluster.report_count += 1;
        cluster.first_seen = cluster.first_seen.min(member.seen_at);
        cluster.last_seen = cluster.last_seen.max(member.seen_at);
        if cluster.has_backtrace && member.frames.len() > cluster.frames.len() {
            cluster.frames = member.frames;
        }

        for key in member.stats {
            *state.stats.entry((cluster_id, key)).or_insert(0) += 1;
        }
        state.reports.insert(member.report_id, cluster_id);
        Ok(AppendOutcome::Appended)
    }

    async fn cluster_stats(&self, cluster_id: Uuid) -> Result<Vec<StatCount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stats
            .iter()
            .filter(|((id, _), _)| *id == cluster_id)
            .map(|((_, key), count)| StatCount {
                key: key.clone(),
                count: *count,
            })
            .collect())
    }

    async fn cluster_of_report(&self, report_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.state.lock().await.reports.get(report_id).copied())
    }
}
