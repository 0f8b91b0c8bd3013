use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::HistorySettings;
use crate::crawler::job::{CrawlJob, CrawlStep};
use crate::dedup::engine::DuplicateRecord;

/// Durable store for crawl-job progress and the duplicate audit trail.
///
/// Every step transition is written here so another process can read a
/// job's current state.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist the full job document (created, and again on terminal).
    async fn save_job(&self, job: &CrawlJob) -> Result<()>;

    /// Persist a single step's latest state.
    async fn update_step(&self, job_id: Uuid, step: &CrawlStep) -> Result<()>;

    /// Load one job by id.
    async fn load_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>>;

    /// Most recent jobs, optionally filtered by source, newest first.
    async fn recent_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<CrawlJob>>;

    /// Append one rejected-duplicate record. Write-once, audit only.
    async fn log_duplicate(&self, record: &DuplicateRecord) -> Result<()>;

    /// Duplicate counts grouped by detection method.
    async fn duplicate_stats(&self) -> Result<HashMap<String, u64>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryHistory {
    inner: Mutex<MemoryHistoryInner>,
}

#[derive(Default)]
struct MemoryHistoryInner {
    jobs: HashMap<Uuid, CrawlJob>,
    duplicates: Vec<DuplicateRecord>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_step(&self, job_id: Uuid, step: &CrawlStep) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if let Some(slot) = job.steps.iter_mut().find(|s| s.kind == step.kind) {
                *slot = step.clone();
            }
        }
        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn recent_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<CrawlJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<CrawlJob> = inner
            .jobs
            .values()
            .filter(|j| source.map_or(true, |s| j.source.eq_ignore_ascii_case(s)))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn log_duplicate(&self, record: &DuplicateRecord) -> Result<()> {
        self.inner.lock().await.duplicates.push(record.clone());
        Ok(())
    }

    async fn duplicate_stats(&self) -> Result<HashMap<String, u64>> {
        let inner = self.inner.lock().await;
        let mut stats = HashMap::new();
        for record in &inner.duplicates {
            *stats.entry(record.method.to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

/// PostgreSQL implementation of the history store. Jobs and steps are kept
/// as JSONB payloads beside the columns status reads filter on.
pub struct PostgresHistory {
    pool: Pool<Postgres>,
    schema: String,
}

impl PostgresHistory {
    pub async fn new(settings: &HistorySettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await
            .context("Failed to connect to PostgreSQL history store")?;

        let store = Self {
            pool,
            schema: settings.schema.clone(),
        };
        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL history store");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await
            .context(format!("Failed to create schema: {}", self.schema))?;

        let jobs = format!(
            "CREATE TABLE IF NOT EXISTS {}.crawl_jobs (
                job_id UUID PRIMARY KEY,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                payload JSONB NOT NULL
            )",
            self.schema
        );
        sqlx::query(&jobs)
            .execute(&self.pool)
            .await
            .context("Failed to create crawl_jobs table")?;

        let steps = format!(
            "CREATE TABLE IF NOT EXISTS {}.crawl_job_steps (
                job_id UUID NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (job_id, kind)
            )",
            self.schema
        );
        sqlx::query(&steps)
            .execute(&self.pool)
            .await
            .context("Failed to create crawl_job_steps table")?;

        let duplicates = format!(
            "CREATE TABLE IF NOT EXISTS {}.posting_duplicates (
                id BIGSERIAL PRIMARY KEY,
                method TEXT NOT NULL,
                detected_at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL
            )",
            self.schema
        );
        sqlx::query(&duplicates)
            .execute(&self.pool)
            .await
            .context("Failed to create posting_duplicates table")?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PostgresHistory {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        let payload = serde_json::to_value(job).context("Failed to serialize crawl job")?;
        let query = format!(
            "INSERT INTO {}.crawl_jobs (job_id, source, status, started_at, completed_at, payload)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (job_id) DO UPDATE
             SET status = $3, completed_at = $5, payload = $6",
            self.schema
        );

        sqlx::query(&query)
            .bind(job.id)
            .bind(&job.source)
            .bind(job.status().to_string())
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .context("Failed to store crawl job in PostgreSQL")?;

        debug!("Stored job {} ({})", job.id, job.source);
        Ok(())
    }

    async fn update_step(&self, job_id: Uuid, step: &CrawlStep) -> Result<()> {
        let payload = serde_json::to_value(step).context("Failed to serialize crawl step")?;
        let query = format!(
            "INSERT INTO {}.crawl_job_steps (job_id, kind, status, payload, updated_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (job_id, kind) DO UPDATE
             SET status = $3, payload = $4, updated_at = NOW()",
            self.schema
        );

        sqlx::query(&query)
            .bind(job_id)
            .bind(step.kind.to_string())
            .bind(step.status.to_string())
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .context("Failed to store step transition in PostgreSQL")?;

        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>> {
        let query = format!(
            "SELECT payload FROM {}.crawl_jobs WHERE job_id = $1",
            self.schema
        );

        let row: Option<Json<CrawlJob>> = sqlx::query_scalar(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query crawl job from PostgreSQL")?;

        Ok(row.map(|json| json.0))
    }

    async fn recent_jobs(&self, source: Option<&str>, limit: usize) -> Result<Vec<CrawlJob>> {
        let rows: Vec<Json<CrawlJob>> = match source {
            Some(source) => {
                let query = format!(
                    "SELECT payload FROM {}.crawl_jobs
                     WHERE LOWER(source) = LOWER($1)
                     ORDER BY started_at DESC LIMIT $2",
                    self.schema
                );
                sqlx::query_scalar(&query)
                    .bind(source)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT payload FROM {}.crawl_jobs
                     ORDER BY started_at DESC LIMIT $1",
                    self.schema
                );
                sqlx::query_scalar(&query)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to query recent crawl jobs from PostgreSQL")?;

        Ok(rows.into_iter().map(|json| json.0).collect())
    }

    async fn log_duplicate(&self, record: &DuplicateRecord) -> Result<()> {
        let payload =
            serde_json::to_value(record).context("Failed to serialize duplicate record")?;
        let query = format!(
            "INSERT INTO {}.posting_duplicates (method, detected_at, payload)
             VALUES ($1, $2, $3)",
            self.schema
        );

        sqlx::query(&query)
            .bind(record.method.to_string())
            .bind(record.detected_at)
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .context("Failed to store duplicate record in PostgreSQL")?;

        Ok(())
    }

    async fn duplicate_stats(&self) -> Result<HashMap<String, u64>> {
        let query = format!(
            "SELECT method, COUNT(*) FROM {}.posting_duplicates GROUP BY method",
            self.schema
        );

        let rows: Vec<(String, i64)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query duplicate statistics from PostgreSQL")?;

        Ok(rows
            .into_iter()
            .map(|(method, count)| (method, count as u64))
            .collect())
    }
}
