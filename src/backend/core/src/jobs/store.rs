//! Durable job storage contract and an in-memory implementation.
//!
//! Every schedule-mutating caller holds the global lock while using the store, so
//! implementations only need atomic single-row writes. Dropping a returned future
//! abandons the operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::job::{Job, JobState};
use crate::error::{Result, SchedulerError};

/// Storage operations the scheduler needs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Find a job by UID.
    async fn find(&self, uid: &str) -> Result<Option<Job>>;

    /// List every job of a group.
    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>>;

    /// Insert a new job. Fails with `DuplicateRecord` if the UID exists.
    async fn create(&self, job: &Job) -> Result<()>;

    /// Insert a job, or update its definition, state and schedule when any
    /// definition field differs from the stored row. Execution counters are kept.
    async fn upsert(&self, job: &Job) -> Result<()>;

    /// Update the definition fields of an existing job.
    async fn update_definition(&self, job: &Job) -> Result<()>;

    /// Persist the full execution state of a job.
    async fn update_execution(&self, job: &Job) -> Result<()>;

    /// Persist only result, progress and update time, and only while the job is
    /// running. A job canceled or finished meanwhile is left untouched.
    async fn update_progress(&self, job: &Job) -> Result<()>;

    /// Number of jobs currently running.
    async fn count_running(&self) -> Result<usize>;

    /// Scheduled jobs due at `now`, highest priority then earliest due first.
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Running jobs whose run deadline is before `now`.
    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Earliest due time of scheduled jobs not yet ready at `now`.
    async fn next_scheduled_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    /// Delete non-recurring terminal jobs last updated before `older_than`.
    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Delete a job. Deleting a missing job is not an error.
    async fn delete_by_uid(&self, uid: &str) -> Result<()>;

    /// Delete every job of a group, returning how many were removed.
    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64>;
}

/// In-memory job store for tests and single-node development.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, uid: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(uid).cloned())
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| j.group_id == group_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.uid.cmp(&b.uid)));
        Ok(found)
    }

    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.uid) {
            return Err(SchedulerError::duplicate_job(&job.uid));
        }
        jobs.insert(job.uid.clone(), job.clone());
        Ok(())
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.uid) {
            None => {
                jobs.insert(job.uid.clone(), job.clone());
            }
            Some(existing) if !existing.same_definition(job) => {
                existing.job_type = job.job_type.clone();
                existing.priority = job.priority;
                existing.data = job.data.clone();
                existing.max_duration_seconds = job.max_duration_seconds;
                existing.max_retries = job.max_retries;
                existing.is_recurring = job.is_recurring;
                existing.recurring_cron = job.recurring_cron.clone();
                existing.state = job.state;
                existing.scheduled = job.scheduled;
                existing.updated = job.updated;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn update_definition(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| SchedulerError::job_not_found(&job.uid))?;
        existing.job_type = job.job_type.clone();
        existing.priority = job.priority;
        existing.data = job.data.clone();
        existing.max_duration_seconds = job.max_duration_seconds;
        existing.max_retries = job.max_retries;
        existing.is_recurring = job.is_recurring;
        existing.recurring_cron = job.recurring_cron.clone();
        existing.updated = job.updated;
        Ok(())
    }

    async fn update_execution(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| SchedulerError::job_not_found(&job.uid))?;
        let created = existing.created;
        *existing = job.clone();
        existing.created = created;
        Ok(())
    }

    async fn update_progress(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| SchedulerError::job_not_found(&job.uid))?;
        if existing.state != JobState::Running {
            return Ok(());
        }
        existing.result = job.result.clone();
        existing.run_progress = job.run_progress;
        existing.updated = job.updated;
        Ok(())
    }

    async fn count_running(&self) -> Result<usize> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.state == JobState::Running).count())
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut ready: Vec<Job> = jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.scheduled <= now)
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.scheduled.cmp(&b.scheduled))
                .then_with(|| a.uid.cmp(&b.uid))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut overdue: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.state == JobState::Running && j.run_deadline.map_or(false, |d| d < now)
            })
            .cloned()
            .collect();
        overdue.sort_by(|a, b| a.run_deadline.cmp(&b.run_deadline));
        Ok(overdue)
    }

    async fn next_scheduled_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.scheduled > now)
            .map(|j| j.scheduled)
            .min())
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.is_recurring || !j.state.is_terminal() || j.updated >= older_than);
        Ok((before - jobs.len()) as u64)
    }

    async fn delete_by_uid(&self, uid: &str) -> Result<()> {
        self.jobs.write().await.remove(uid);
        Ok(())
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.group_id != group_id);
        Ok((before - jobs.len()) as u64)
    }
}
