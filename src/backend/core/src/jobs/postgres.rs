//! PostgreSQL job store.
//!
//! Uses sqlx with the `jobs` table created by the bundled migrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use super::job::{Job, JobPriority, JobState};
use super::store::JobStore;
use crate::config::DatabaseConfig;
use crate::error::{Result, SchedulerError};

const JOB_COLUMNS: &str = r#"
    uid, group_id, created, updated, job_type, priority, data, result,
    max_duration_seconds, max_retries, state, scheduled, total_executions,
    run_by, run_deadline, run_progress, last_executed, is_recurring,
    recurring_cron, consecutive_failures, last_failure_error
"#;

/// Job store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connect a new pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SchedulerError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find(&self, uid: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE uid = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE group_id = $1 ORDER BY created, uid",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                uid, group_id, created, updated, job_type, priority, data, result,
                max_duration_seconds, max_retries, state, scheduled, total_executions,
                run_by, run_deadline, run_progress, last_executed, is_recurring,
                recurring_cron, consecutive_failures, last_failure_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(&job.uid)
        .bind(&job.group_id)
        .bind(job.created)
        .bind(job.updated)
        .bind(&job.job_type)
        .bind(job.priority.as_i16())
        .bind(&job.data)
        .bind(&job.result)
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(job.state.as_str())
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(&job.run_by)
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.is_recurring)
        .bind(&job.recurring_cron)
        .bind(job.consecutive_failures)
        .bind(&job.last_failure_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                uid, group_id, created, updated, job_type, priority, data,
                max_duration_seconds, max_retries, state, scheduled, is_recurring,
                recurring_cron
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (uid) DO UPDATE SET
                updated = EXCLUDED.updated,
                job_type = EXCLUDED.job_type,
                priority = EXCLUDED.priority,
                data = EXCLUDED.data,
                max_duration_seconds = EXCLUDED.max_duration_seconds,
                max_retries = EXCLUDED.max_retries,
                state = EXCLUDED.state,
                scheduled = EXCLUDED.scheduled,
                is_recurring = EXCLUDED.is_recurring,
                recurring_cron = EXCLUDED.recurring_cron
            WHERE (jobs.job_type, jobs.priority, jobs.data, jobs.max_duration_seconds,
                   jobs.max_retries, jobs.is_recurring, jobs.recurring_cron)
                IS DISTINCT FROM
                  (EXCLUDED.job_type, EXCLUDED.priority, EXCLUDED.data,
                   EXCLUDED.max_duration_seconds, EXCLUDED.max_retries,
                   EXCLUDED.is_recurring, EXCLUDED.recurring_cron)
            "#,
        )
        .bind(&job.uid)
        .bind(&job.group_id)
        .bind(job.created)
        .bind(job.updated)
        .bind(&job.job_type)
        .bind(job.priority.as_i16())
        .bind(&job.data)
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(job.state.as_str())
        .bind(job.scheduled)
        .bind(job.is_recurring)
        .bind(&job.recurring_cron)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_definition(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated = $2, job_type = $3, priority = $4, data = $5,
                max_duration_seconds = $6, max_retries = $7, is_recurring = $8,
                recurring_cron = $9
            WHERE uid = $1
            "#,
        )
        .bind(&job.uid)
        .bind(job.updated)
        .bind(&job.job_type)
        .bind(job.priority.as_i16())
        .bind(&job.data)
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(job.is_recurring)
        .bind(&job.recurring_cron)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::job_not_found(&job.uid));
        }
        Ok(())
    }

    async fn update_execution(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated = $2, result = $3, state = $4, scheduled = $5,
                total_executions = $6, run_by = $7, run_deadline = $8,
                run_progress = $9, last_executed = $10, consecutive_failures = $11,
                last_failure_error = $12, max_duration_seconds = $13
            WHERE uid = $1
            "#,
        )
        .bind(&job.uid)
        .bind(job.updated)
        .bind(&job.result)
        .bind(job.state.as_str())
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(&job.run_by)
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.consecutive_failures)
        .bind(&job.last_failure_error)
        .bind(job.max_duration_seconds)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::job_not_found(&job.uid));
        }
        Ok(())
    }

    async fn update_progress(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated = $2, result = $3, run_progress = $4
            WHERE uid = $1 AND state = 'running'
            "#,
        )
        .bind(&job.uid)
        .bind(job.updated)
        .bind(&job.result)
        .bind(job.run_progress)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE uid = $1)")
                .bind(&job.uid)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(SchedulerError::job_not_found(&job.uid));
            }
        }
        Ok(())
    }

    async fn count_running(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'running'")
            .fetch_one(&self.pool)
            .await?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE state = 'scheduled' AND scheduled <= $1
            ORDER BY priority DESC, scheduled ASC, uid ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE state = 'running' AND run_deadline < $1
            ORDER BY run_deadline ASC
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn next_scheduled_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let next: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(scheduled) FROM jobs WHERE state = 'scheduled' AND scheduled > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE NOT is_recurring
              AND state IN ('finished', 'failed', 'canceled')
              AND updated < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_by_uid(&self, uid: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    uid: String,
    group_id: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    job_type: String,
    priority: i16,
    data: String,
    result: String,
    max_duration_seconds: i32,
    max_retries: i32,
    state: String,
    scheduled: DateTime<Utc>,
    total_executions: i32,
    run_by: String,
    run_deadline: Option<DateTime<Utc>>,
    run_progress: i32,
    last_executed: Option<DateTime<Utc>>,
    is_recurring: bool,
    recurring_cron: String,
    consecutive_failures: i32,
    last_failure_error: String,
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

impl TryFrom<JobRow> for Job {
    type Error = SchedulerError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            state: row.state.parse::<JobState>()?,
            priority: JobPriority::from_i16(row.priority),
            uid: row.uid,
            group_id: row.group_id,
            created: row.created,
            updated: row.updated,
            job_type: row.job_type,
            data: row.data,
            result: row.result,
            max_duration_seconds: row.max_duration_seconds,
            max_retries: row.max_retries,
            scheduled: row.scheduled,
            total_executions: row.total_executions,
            run_by: row.run_by,
            run_deadline: row.run_deadline,
            run_progress: row.run_progress,
            last_executed: row.last_executed,
            is_recurring: row.is_recurring,
            recurring_cron: row.recurring_cron,
            consecutive_failures: row.consecutive_failures,
            last_failure_error: row.last_failure_error,
        })
    }
}
