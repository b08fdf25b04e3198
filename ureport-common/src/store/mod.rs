use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

mod memory;
mod postgres;
mod stats;

pub use memory::MemoryClusterStore;
pub use postgres::PgClusterStore;
pub use stats::{report_stats, uptime_exponent, Stat, StatCount, StatKey};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cluster store is unavailable: {0}")]
    Unavailable(String),
    #[error("cluster store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("cluster {0} does not exist")]
    MissingCluster(Uuid),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("could not run migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

/// One distinct bug. Created when nothing matches, mutated on match, never deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemCluster {
    pub id: Uuid,
    /// Fingerprint of the report that created the cluster
    pub fingerprint: String,
    pub component: String,
    pub crash_type: String,
    /// Representative normalized backtrace, innermost first
    pub frames: Vec<String>,
    pub has_backtrace: bool,
    pub report_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub fingerprint: String,
    pub component: String,
    pub crash_type: String,
    pub frames: Vec<String>,
    pub has_backtrace: bool,
    pub seen_at: DateTime<Utc>,
}

impl NewCluster {
    pub fn from_fingerprint(fingerprint: &Fingerprint, seen_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.value.clone(),
            component: fingerprint.component.clone(),
            crash_type: fingerprint.crash_type.clone(),
            frames: fingerprint.frames.clone(),
            has_backtrace: !fingerprint.is_fallback(),
            seen_at,
        }
    }

    pub(crate) fn into_cluster(self, id: Uuid) -> ProblemCluster {
        ProblemCluster {
            id,
            fingerprint: self.fingerprint,
            component: self.component,
            crash_type: self.crash_type,
            frames: self.frames,
            has_backtrace: self.has_backtrace,
            report_count: 0,
            first_seen: self.seen_at,
            last_seen: self.seen_at,
        }
    }
}

/// A report being attached to a cluster.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub report_id: String,
    pub fingerprint: String,
    pub frames: Vec<String>,
    pub seen_at: DateTime<Utc>,
    /// Occurrence counters this report adds to the cluster, each key once
    pub stats: Vec<StatKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub cluster: ProblemCluster,
    /// False when another writer created the cluster for this fingerprint first
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The report identity was attached before, nothing changed
    AlreadyAttached,
}

/// Durable cluster storage shared by every worker. All mutations are idempotent, by
/// fingerprint for clusters and by report identity for members.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ProblemCluster>, StoreError>;

    /// Clusters with a backtrace for this component and crash type, most recently active first.
    async fn candidates(
        &self,
        component: &str,
        crash_type: &str,
        limit: usize,
    ) -> Result<Vec<ProblemCluster>, StoreError>;

    /// Create a cluster unless one already owns the fingerprint, returning whichever won.
    async fn create_if_absent(&self, cluster: NewCluster) -> Result<CreateOutcome, StoreError>;

    /// Point an extra fingerprint at a cluster. Returns the cluster the fingerprint ends up
    /// pointing at, which is not `cluster_id` when it was already linked elsewhere.
    async fn link_fingerprint(&self, fingerprint: &str, cluster_id: Uuid)
        -> Result<Uuid, StoreError>;

    /// Attach a report and bump its counters, both only the first time the identity is seen.
    async fn append_report(
        &self,
        cluster_id: Uuid,
        member: ClusterMember,
    ) -> Result<AppendOutcome, StoreError>;

    /// Occurrence counters of a cluster, ordered by key.
    async fn cluster_stats(&self, cluster_id: Uuid) -> Result<Vec<StatCount>, StoreError>;

    /// Cluster a report identity was attached to, if any.
    async fn cluster_of_report(&self, report_id: &str) -> Result<Option<Uuid>, StoreError>;
}
