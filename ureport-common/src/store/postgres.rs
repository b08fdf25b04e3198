use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    AppendOutcome, ClusterMember, ClusterStore, CreateOutcome, NewCluster, ProblemCluster, Stat,
    StatCount, StatKey, StoreError,
};

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    fingerprint: String,
    component: String,
    crash_type: String,
    frames: Json<Vec<String>>,
    has_backtrace: bool,
    report_count: i64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl From<ClusterRow> for ProblemCluster {
    fn from(row: ClusterRow) -> Self {
        ProblemCluster {
            id: row.id,
            fingerprint: row.fingerprint,
            component: row.component,
            crash_type: row.crash_type,
            frames: row.frames.0,
            has_backtrace: row.has_backtrace,
            report_count: row.report_count,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        }
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

/// Cluster store backed by PostgreSQL. Races between workers are settled by the primary
/// keys on `ureport_cluster_fingerprints.fingerprint` and `ureport_cluster_reports.report_id`.
#[derive(Clone)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_by_fingerprint<'c, E>(
        executor: E,
        fingerprint: &str,
    ) -> Result<Option<ProblemCluster>, StoreError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let row: Option<ClusterRow> = sqlx::query_as(
            r#"
SELECT c.id, c.fingerprint, c.component, c.crash_type, c.frames, c.has_backtrace,
       c.report_count, c.first_seen, c.last_seen
FROM ureport_cluster_fingerprints f
JOIN ureport_clusters c ON c.id = f.cluster_id
WHERE f.fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(executor)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl ClusterStore for PgClusterStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ProblemCluster>, StoreError> {
        Self::load_by_fingerprint(&self.pool, fingerprint).await
    }

    async fn candidates(
        &self,
        component: &str,
        crash_type: &str,
        limit: usize,
    ) -> Result<Vec<ProblemCluster>, StoreError> {
        let rows: Vec<ClusterRow> = sqlx::query_as(
            r#"
SELECT id, fingerprint, component, crash_type, frames, has_backtrace,
       report_count, first_seen, last_seen
FROM ureport_clusters
WHERE component = $1 AND crash_type = $2 AND has_backtrace
ORDER BY last_seen DESC, id
LIMIT $3
            "#,
        )
        .bind(component)
        .bind(crash_type)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_if_absent(&self, cluster: NewCluster) -> Result<CreateOutcome, StoreError> {
        let cluster_id = Uuid::now_v7();
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        let row: ClusterRow = sqlx::query_as(
            r#"
INSERT INTO ureport_clusters
    (id, fingerprint, component, crash_type, frames, has_backtrace, report_count, first_seen, last_seen)
VALUES
    ($1, $2, $3, $4, $5, $6, 0, $7, $7)
RETURNING id, fingerprint, component, crash_type, frames, has_backtrace,
          report_count, first_seen, last_seen
            "#,
        )
        .bind(cluster_id)
        .bind(&cluster.fingerprint)
        .bind(&cluster.component)
        .bind(&cluster.crash_type)
        .bind(Json(&cluster.frames))
        .bind(cluster.has_backtrace)
        .bind(cluster.seen_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?;

        // Blocks on a concurrent insert of the same fingerprint until that one commits
        let linked: Option<Uuid> = sqlx::query_scalar(
            r#"
INSERT INTO ureport_cluster_fingerprints (fingerprint, cluster_id)
VALUES ($1, $2)
ON CONFLICT (fingerprint) DO NOTHING
RETURNING cluster_id
            "#,
        )
        .bind(&cluster.fingerprint)
        .bind(cluster_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?;

        if linked.is_some() {
            tx.commit().await.map_err(query_error("COMMIT"))?;
            return Ok(CreateOutcome {
                cluster: row.into(),
                created: true,
            });
        }

        // Someone else owns the fingerprint, drop our cluster and hand back theirs
        tx.rollback().await.map_err(query_error("ROLLBACK"))?;
        let existing = Self::load_by_fingerprint(&self.pool, &cluster.fingerprint)
            .await?
            .ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "fingerprint {} conflicted but has no cluster",
                    cluster.fingerprint
                ))
            })?;

        Ok(CreateOutcome {
            cluster: existing,
            created: false,
        })
    }

    async fn link_fingerprint(
        &self,
        fingerprint: &str,
        cluster_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        sqlx::query(
            r#"
INSERT INTO ureport_cluster_fingerprints (fingerprint, cluster_id)
VALUES ($1, $2)
ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .bind(cluster_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("INSERT"))?;

        sqlx::query_scalar("SELECT cluster_id FROM ureport_cluster_fingerprints WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn append_report(
        &self,
        cluster_id: Uuid,
        member: ClusterMember,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        let inserted = sqlx::query(
            r#"
INSERT INTO ureport_cluster_reports (report_id, cluster_id, fingerprint, seen_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (report_id) DO NOTHING
            "#,
        )
        .bind(&member.report_id)
        .bind(cluster_id)
        .bind(&member.fingerprint)
        .bind(member.seen_at)
        .execute(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(query_error("ROLLBACK"))?;
            return Ok(AppendOutcome::AlreadyAttached);
        }

        let updated = sqlx::query(
            r#"
UPDATE ureport_clusters
SET
    report_count = report_count + 1,
    first_seen = LEAST(first_seen, $2),
    last_seen = GREATEST(last_seen, $2),
    frames = CASE
        WHEN has_backtrace AND jsonb_array_length($3) > jsonb_array_length(frames) THEN $3
        ELSE frames
    END
WHERE id = $1
            "#,
        )
        .bind(cluster_id)
        .bind(member.seen_at)
        .bind(Json(&member.frames))
        .execute(&mut *tx)
        .await
        .map_err(query_error("UPDATE"))?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(query_error("ROLLBACK"))?;
            return Err(StoreError::MissingCluster(cluster_id));
        }

        let (stats, values): (Vec<String>, Vec<String>) = member
            .stats
            .into_iter()
            .map(|key| (key.stat.as_str().to_owned(), key.value))
            .unzip();
        sqlx::query(
            r#"
INSERT INTO ureport_cluster_stats (cluster_id, stat, value, count)
SELECT $1, s.stat, s.value, 1
FROM UNNEST($2::text[], $3::text[]) AS s (stat, value)
ON CONFLICT (cluster_id, stat, value) DO UPDATE SET count = ureport_cluster_stats.count + 1
            "#,
        )
        .bind(cluster_id)
        .bind(stats)
        .bind(values)
        .execute(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?;

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(AppendOutcome::Appended)
    }

    async fn cluster_stats(&self, cluster_id: Uuid) -> Result<Vec<StatCount>, StoreError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT stat, value, count FROM ureport_cluster_stats WHERE cluster_id = $1",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        let mut stats: Vec<StatCount> = rows
            .into_iter()
            .filter_map(|(stat, value, count)| {
                Some(StatCount {
                    key: StatKey::new(Stat::parse(&stat)?, value),
                    count,
                })
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stats)
    }

    async fn cluster_of_report(&self, report_id: &str) -> Result<Option<Uuid>, StoreError> {
        sqlx::query_scalar("SELECT cluster_id FROM ureport_cluster_reports WHERE report_id = $1")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}
