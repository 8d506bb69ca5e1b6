//! SQLite-based run history

use crate::core::state::{PipelineResult, PipelineStatus};
use crate::report::{RunSummary, StatusSink};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Run history store; doubles as a status sink
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection: every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0,
                result TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn parse_status(status: &str) -> PipelineStatus {
        match status {
            "Succeeded" => PipelineStatus::Succeeded,
            "Skipped" => PipelineStatus::Skipped,
            "Cancelled" => PipelineStatus::Cancelled,
            _ => PipelineStatus::Failed,
        }
    }

    fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunSummary> {
        Ok(RunSummary {
            execution_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline: row.get("pipeline"),
            git_ref: row.get("git_ref"),
            status: Self::parse_status(&row.get::<String, _>("status")),
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: Self::from_naive(row.get("finished_at")),
            jobs: row.get::<i64, _>("jobs") as usize,
            failed_jobs: row.get::<i64, _>("failed_jobs") as usize,
        })
    }

    /// Insert or replace the record for `result.execution_id`
    pub async fn save(&self, result: &PipelineResult) -> Result<()> {
        let summary = RunSummary::from_result(result);
        let body = serde_json::to_string(result).context("Failed to serialize result")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline, git_ref, status, started_at, finished_at, jobs, failed_jobs, result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(summary.execution_id.to_string())
        .bind(&summary.pipeline)
        .bind(&summary.git_ref)
        .bind(summary.status.to_string())
        .bind(Self::to_naive(summary.started_at))
        .bind(Self::to_naive(summary.finished_at))
        .bind(summary.jobs as i64)
        .bind(summary.failed_jobs as i64)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    /// Full result of one run
    pub async fn load(&self, execution_id: Uuid) -> Result<Option<PipelineResult>> {
        let row = sqlx::query("SELECT result FROM runs WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        match row {
            Some(row) => {
                let body: String = row.get("result");
                Ok(Some(serde_json::from_str(&body).context("Stored result is corrupt")?))
            }
            None => Ok(None),
        }
    }

    /// Most recent runs first, optionally for one pipeline
    pub async fn list(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = match pipeline {
            Some(pipeline) => {
                sqlx::query(
                    r#"
                    SELECT id, pipeline, git_ref, status, started_at, finished_at, jobs, failed_jobs
                    FROM runs
                    WHERE pipeline = ?1
                    ORDER BY started_at DESC
                    LIMIT ?2
                    "#,
                )
                .bind(pipeline)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, pipeline, git_ref, status, started_at, finished_at, jobs, failed_jobs
                    FROM runs
                    ORDER BY started_at DESC
                    LIMIT ?1
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list runs")?;

        rows.iter().map(Self::summary_from_row).collect()
    }

    /// Distinct pipeline names with recorded runs
    pub async fn pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline FROM runs ORDER BY pipeline ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline")).collect())
    }
}

#[async_trait::async_trait]
impl StatusSink for SqliteStatusStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn update(&self, result: &PipelineResult) -> Result<()> {
        self.save(result).await
    }
}
