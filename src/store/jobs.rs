//! Durable job snapshots for recovery and listings.
//!
//! The scheduler's in-memory registry is authoritative while the process
//! lives; every emitted event upserts a snapshot here so listings and
//! ETA metrics survive restarts. `artifact_available` is recomputed on
//! each write by stat-ing the artifact path.

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::Job;

/// One persisted job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: String,
    /// Owning anon id.
    pub owner_id: String,
    /// Job type string.
    #[serde(rename = "type")]
    pub kind: String,
    /// Terminal or in-flight status string.
    pub status: String,
    /// Progress percentage.
    pub progress: f64,
    /// Enqueue time, epoch seconds.
    pub created_at: Option<f64>,
    /// Start time, epoch seconds.
    pub started_at: Option<f64>,
    /// End time, epoch seconds.
    pub ended_at: Option<f64>,
    /// Error message, when failed/cancelled.
    pub error: Option<String>,
    /// Result map (e.g. `image_path`).
    pub result: Map<String, Value>,
    /// Whether the artifact behind `result.image_path` exists on disk.
    pub artifact_available: bool,
}

/// SQLite-backed job snapshot store.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
    output_dir: PathBuf,
}

impl JobStore {
    /// Open (or create) the store and run migrations. `output_dir` is the
    /// filesystem root behind `/outputs`, used for artifact stat checks.
    pub async fn new(db_path: &Path, output_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            output_dir: output_dir.into(),
        })
    }

    /// Build a store over an existing pool (shared app database).
    pub async fn from_pool(pool: SqlitePool, output_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            output_dir: output_dir.into(),
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL,
                created_at REAL,
                started_at REAL,
                ended_at REAL,
                error TEXT,
                result_json TEXT,
                artifact_available INTEGER
            )
            ",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at DESC)")
            .execute(pool)
            .await?;

        // Additive migration for pre-availability databases.
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'artifact_available'",
        )
        .fetch_one(pool)
        .await?;
        if exists == 0 {
            tracing::info!("adding jobs.artifact_available column");
            sqlx::query("ALTER TABLE jobs ADD COLUMN artifact_available INTEGER")
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    fn schema_gone(err: &sqlx::Error) -> bool {
        err.to_string().contains("no such table")
    }

    /// Whether the artifact referenced by a result map exists on disk.
    #[must_use]
    pub fn artifact_available(&self, result: &Map<String, Value>) -> bool {
        let Some(web_path) = result.get("image_path").and_then(Value::as_str) else {
            return false;
        };
        let rel = web_path
            .strip_prefix("/outputs/")
            .or_else(|| web_path.strip_prefix("outputs/"));
        rel.is_some_and(|rel| self.output_dir.join(rel).exists())
    }

    /// UPSERT the snapshot of an in-memory job, recomputing artifact
    /// availability. Re-initialises the schema and retries once if the
    /// database file vanished at runtime.
    pub async fn upsert_job(&self, job: &Job) -> anyhow::Result<()> {
        let snapshot = self.snapshot_of(job);
        match self.upsert_row(&snapshot).await {
            Ok(()) => Ok(()),
            Err(err) if Self::schema_gone(&err) => {
                tracing::warn!("jobs schema missing, re-initialising");
                Self::run_migrations(&self.pool).await?;
                Ok(self.upsert_row(&snapshot).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn snapshot_of(&self, job: &Job) -> JobSnapshot {
        JobSnapshot {
            id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            kind: job.kind.as_str().to_owned(),
            status: job.status.as_str().to_owned(),
            progress: job.progress,
            created_at: Some(epoch(job.created_at)),
            started_at: job.started_at.map(epoch),
            ended_at: job.ended_at.map(epoch),
            error: job.error_message.clone(),
            result: job.result.clone(),
            artifact_available: self.artifact_available(&job.result),
        }
    }

    async fn upsert_row(&self, snapshot: &JobSnapshot) -> Result<(), sqlx::Error> {
        let result_json = serde_json::to_string(&snapshot.result).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            r"
            INSERT INTO jobs (id, owner_id, type, status, progress, created_at, started_at, ended_at, error, result_json, artifact_available)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner_id=excluded.owner_id,
                type=excluded.type,
                status=excluded.status,
                progress=excluded.progress,
                created_at=excluded.created_at,
                started_at=excluded.started_at,
                ended_at=excluded.ended_at,
                error=excluded.error,
                result_json=excluded.result_json,
                artifact_available=excluded.artifact_available
            ",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.owner_id)
        .bind(&snapshot.kind)
        .bind(&snapshot.status)
        .bind(snapshot.progress)
        .bind(snapshot.created_at)
        .bind(snapshot.started_at)
        .bind(snapshot.ended_at)
        .bind(&snapshot.error)
        .bind(result_json)
        .bind(i64::from(snapshot.artifact_available))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent snapshots by `created_at`, newest first.
    pub async fn fetch_recent(&self, limit: i64) -> anyhow::Result<Vec<JobSnapshot>> {
        let rows = match self.fetch_rows(limit).await {
            Ok(rows) => rows,
            Err(err) if Self::schema_gone(&err) => {
                tracing::warn!("jobs schema missing, re-initialising");
                Self::run_migrations(&self.pool).await?;
                self.fetch_rows(limit).await?
            }
            Err(err) => return Err(err.into()),
        };
        Ok(rows)
    }

    async fn fetch_rows(&self, limit: i64) -> Result<Vec<JobSnapshot>, sqlx::Error> {
        let rows = sqlx::query(
            r"
            SELECT id, owner_id, type, status, progress, created_at, started_at, ended_at,
                   error, result_json, COALESCE(artifact_available, 0) AS artifact_available
            FROM jobs ORDER BY created_at DESC LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| JobSnapshot {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                kind: row.get("type"),
                status: row.get("status"),
                progress: row.get("progress"),
                created_at: row.get("created_at"),
                started_at: row.get("started_at"),
                ended_at: row.get("ended_at"),
                error: row.get("error"),
                result: row
                    .get::<Option<String>, _>("result_json")
                    .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
                    .unwrap_or_default(),
                artifact_available: row.get::<i64, _>("artifact_available") != 0,
            })
            .collect())
    }

    /// Health probe: one small write/prune round trip through the pool.
    pub async fn health_write_check(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __healthz (id INTEGER PRIMARY KEY AUTOINCREMENT, ts INTEGER)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT INTO __healthz (ts) VALUES (?)")
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM __healthz WHERE id IN (SELECT id FROM __healthz ORDER BY id DESC LIMIT -1 OFFSET 50)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute `artifact_available` for the newest `limit` rows.
    /// Returns how many rows were rewritten.
    pub async fn sweep(&self, limit: i64) -> anyhow::Result<usize> {
        let rows = self.fetch_recent(limit).await?;
        let mut updated = 0;
        for mut snapshot in rows {
            snapshot.artifact_available = self.artifact_available(&snapshot.result);
            if self.upsert_row(&snapshot).await.is_ok() {
                updated += 1;
            }
        }
        Ok(updated)
    }
}

fn epoch(at: chrono::DateTime<chrono::Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
