//! PostgreSQL job store.
//!
//! Status writes run in a transaction: a conditional `UPDATE ... WHERE
//! status = ANY(...)` followed by an append to the history table.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::jobs::{Job, JobStatus, JobStore, NewJob, StatusChange, Transition, legal_sources};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rpa_jobs (
    id          BIGSERIAL PRIMARY KEY,
    provider    TEXT NOT NULL,
    action      TEXT NOT NULL,
    parameters  JSONB NOT NULL DEFAULT '{}'::jsonb,
    status      TEXT NOT NULL DEFAULT 'pending',
    result      JSONB,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_rpa_jobs_status_created
    ON rpa_jobs (status, created_at);

CREATE TABLE IF NOT EXISTS rpa_job_status_history (
    id         BIGSERIAL PRIMARY KEY,
    job_id     BIGINT NOT NULL REFERENCES rpa_jobs(id),
    status     TEXT NOT NULL,
    reason     TEXT,
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_rpa_job_status_history_job
    ON rpa_job_status_history (job_id, changed_at);
"#;

const JOB_COLUMNS: &str = "id, provider, action, parameters, status, result, retry_count, \
                           max_retries, created_at, updated_at";

pub struct PostgresJobStore {
    pool: Pool,
}

impl PostgresJobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from config. No connection is made until first use.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let url = config.url.as_ref().ok_or_else(|| {
            StoreError::Unavailable("DATABASE_URL is not set".to_string())
        })?;

        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let max_retries = i32::try_from(new.max_retries).unwrap_or(i32::MAX);
        let row = tx
            .query_one(
                &format!(
                    r#"
                    INSERT INTO rpa_jobs (provider, action, parameters, max_retries)
                    VALUES ($1, $2, $3, $4)
                    RETURNING {JOB_COLUMNS}
                    "#
                ),
                &[&new.provider, &new.action, &new.parameters, &max_retries],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let job = row_to_job(&row)?;

        tx.execute(
            "INSERT INTO rpa_job_status_history (job_id, status) VALUES ($1, $2)",
            &[&job.id, &JobStatus::Pending.as_str()],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(job)
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = client
            .query_opt(
                &format!("SELECT {JOB_COLUMNS} FROM rpa_jobs WHERE id = $1"),
                &[&id],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn transition(
        &self,
        id: i64,
        from: &[JobStatus],
        to: JobStatus,
        result: Option<serde_json::Value>,
        reason: Option<&str>,
    ) -> Result<Transition, StoreError> {
        let allowed: Vec<&str> = legal_sources(from, to)
            .iter()
            .map(|s| s.as_str())
            .collect();

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let updated = tx
            .query_opt(
                &format!(
                    r#"
                    UPDATE rpa_jobs
                    SET status = $2, result = COALESCE($3, result), updated_at = NOW()
                    WHERE id = $1 AND status = ANY($4)
                    RETURNING {JOB_COLUMNS}
                    "#
                ),
                &[&id, &to.as_str(), &result, &allowed],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let Some(row) = updated else {
            let current = tx
                .query_opt("SELECT status FROM rpa_jobs WHERE id = $1", &[&id])
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?
                .ok_or(StoreError::NotFound { id })?;
            let status: String = current.get("status");
            let current = status.parse().map_err(StoreError::Query)?;
            return Ok(Transition::Rejected { current });
        };
        let job = row_to_job(&row)?;

        tx.execute(
            "INSERT INTO rpa_job_status_history (job_id, status, reason) VALUES ($1, $2, $3)",
            &[&id, &to.as_str(), &reason],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(Transition::Applied(job))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM rpa_jobs
                    WHERE status = $1
                    ORDER BY created_at, id
                    LIMIT $2 OFFSET $3
                    "#
                ),
                &[&status.as_str(), &limit, &offset],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn history(&self, id: i64) -> Result<Vec<StatusChange>, StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let rows = client
            .query(
                r#"
                SELECT status, reason, changed_at FROM rpa_job_status_history
                WHERE job_id = $1
                ORDER BY changed_at, id
                "#,
                &[&id],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StatusChange {
                    status: status.parse().map_err(StoreError::Query)?,
                    at: row.get("changed_at"),
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let rows = client
            .query(
                "SELECT status, COUNT(*) AS n FROM rpa_jobs GROUP BY status",
                &[],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<JobStatus>() {
                Ok(s) => {
                    counts.insert(s, n.max(0) as u64);
                }
                Err(e) => tracing::warn!("Ignoring jobs with unrecognized status: {}", e),
            }
        }
        Ok(counts)
    }
}

fn row_to_job(row: &tokio_postgres::Row) -> Result<Job, StoreError> {
    let status: String = row.get("status");
    let retry_count: i32 = row.get("retry_count");
    let max_retries: i32 = row.get("max_retries");

    Ok(Job {
        id: row.get("id"),
        provider: row.get("provider"),
        action: row.get("action"),
        parameters: row.get("parameters"),
        status: status.parse().map_err(StoreError::Query)?,
        result: row.get("result"),
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
